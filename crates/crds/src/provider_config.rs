//! ProviderConfig CRD (network view)
//!
//! Only the `spec.network` section is modeled here: the ordered pool list,
//! load-balancer sizing and per-tenant quotas that the allocator consumes.
//! Infrastructure-specific fields are ignored on deserialization.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default static load-balancer pool size
pub const DEFAULT_LB_POOL_SIZE: u32 = 8;

/// Default elastic starting size
pub const DEFAULT_LB_INITIAL_POOL_SIZE: u32 = 4;

/// Default elastic growth step
pub const DEFAULT_LB_GROWTH_INCREMENT: u32 = 2;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "butler.butlerlabs.dev",
    version = "v1alpha1",
    kind = "ProviderConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigSpec {
    /// Infrastructure provider type (e.g. "harvester", "nutanix", "proxmox")
    #[serde(default)]
    pub provider: String,

    /// IPAM network configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<ProviderNetworkConfig>,
}

/// Network configuration for clusters built on this provider
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderNetworkConfig {
    /// Candidate pools, tried by ascending priority then list order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pool_refs: Vec<PoolPriorityRef>,

    /// Load-balancer pool sizing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<ProviderLoadBalancerConfig>,

    /// Per-tenant address limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota_per_tenant: Option<TenantQuota>,
}

/// A pool reference with a priority (lower value is tried first)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolPriorityRef {
    /// NetworkPool name
    pub name: String,

    /// Priority, lower first
    #[serde(default)]
    pub priority: i32,
}

/// Load-balancer sizing mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerAllocationMode {
    /// Fixed size (`defaultPoolSize`)
    #[default]
    Static,

    /// Starts at `initialPoolSize` and grows with demand
    Elastic,
}

/// Load-balancer sizing
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLoadBalancerConfig {
    /// Sizing mode
    #[serde(default)]
    pub allocation_mode: LoadBalancerAllocationMode,

    /// Pool size in static mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pool_size: Option<u32>,

    /// Starting size and shrink floor in elastic mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_pool_size: Option<u32>,

    /// Addresses added per growth step in elastic mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub growth_increment: Option<u32>,
}

impl ProviderLoadBalancerConfig {
    /// Pool size in static mode
    pub fn default_pool_size(&self) -> u32 {
        self.default_pool_size.unwrap_or(DEFAULT_LB_POOL_SIZE)
    }

    /// Starting size in elastic mode
    pub fn initial_pool_size(&self) -> u32 {
        self.initial_pool_size.unwrap_or(DEFAULT_LB_INITIAL_POOL_SIZE)
    }

    /// Growth step in elastic mode
    pub fn growth_increment(&self) -> u32 {
        self.growth_increment.unwrap_or(DEFAULT_LB_GROWTH_INCREMENT)
    }

    /// Number of addresses a fresh load-balancer allocation starts with
    pub fn starting_size(&self) -> u32 {
        match self.allocation_mode {
            LoadBalancerAllocationMode::Static => self.default_pool_size(),
            LoadBalancerAllocationMode::Elastic => self.initial_pool_size(),
        }
    }
}

/// Per-tenant address limits
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TenantQuota {
    /// Maximum node IPs held by one tenant cluster
    #[serde(rename = "maxNodeIPs", default, skip_serializing_if = "Option::is_none")]
    pub max_node_ips: Option<u64>,

    /// Maximum load-balancer IPs held by one tenant cluster
    #[serde(rename = "maxLoadBalancerIPs", default, skip_serializing_if = "Option::is_none")]
    pub max_load_balancer_ips: Option<u64>,
}
