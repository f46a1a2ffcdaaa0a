//! NetworkPool CRD
//!
//! Defines a platform-level IPv4 pool for on-prem IPAM: a base CIDR, reserved
//! sub-ranges that are never handed out, and an optional tenant allocation
//! window with per-tenant default sizes.

use crate::conditions::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default number of node IPs per tenant
pub const DEFAULT_NODES_PER_TENANT: u32 = 5;

/// Default number of load-balancer IPs per tenant
pub const DEFAULT_LB_POOL_PER_TENANT: u32 = 8;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "butler.butlerlabs.dev",
    version = "v1alpha1",
    kind = "NetworkPool",
    namespaced,
    status = "NetworkPoolStatus",
    shortname = "np",
    printcolumn = r#"{"name":"CIDR","type":"string","jsonPath":".spec.cidr","description":"Network CIDR"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableIPs","description":"Available IPs"}"#,
    printcolumn = r#"{"name":"Allocated","type":"integer","jsonPath":".status.allocatedIPs","description":"Allocated IPs"}"#,
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.totalIPs","description":"Total usable IPs"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPoolSpec {
    /// Network range in CIDR notation (e.g. "10.50.0.0/24")
    #[schemars(regex(pattern = r"^(\d{1,3}\.){3}\d{1,3}/\d{1,2}$"))]
    pub cidr: String,

    /// Ranges excluded from allocation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved: Vec<ReservedRange>,

    /// Allocatable sub-range and per-tenant defaults.
    /// If not specified, the entire CIDR (minus reserved ranges) is allocatable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_allocation: Option<TenantAllocationConfig>,
}

/// A range of IPs excluded from allocation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReservedRange {
    /// Reserved range in CIDR notation
    #[schemars(regex(pattern = r"^(\d{1,3}\.){3}\d{1,3}/\d{1,2}$"))]
    pub cidr: String,

    /// Why this range is reserved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Allocatable window and defaults for tenant allocations
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenantAllocationConfig {
    /// First allocatable IP address (defaults to the start of the CIDR)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(regex(pattern = r"^(\d{1,3}\.){3}\d{1,3}$"))]
    pub start: Option<String>,

    /// Last allocatable IP address (defaults to the end of the CIDR)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(regex(pattern = r"^(\d{1,3}\.){3}\d{1,3}$"))]
    pub end: Option<String>,

    /// Default allocation sizes per tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<TenantAllocationDefaults>,
}

/// Default allocation sizes per tenant
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TenantAllocationDefaults {
    /// Default number of node IPs per tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub nodes_per_tenant: Option<u32>,

    /// Default number of load balancer IPs per tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub lb_pool_per_tenant: Option<u32>,
}

impl NetworkPoolSpec {
    /// Node IPs handed to a tenant when the request carries no count
    pub fn nodes_per_tenant(&self) -> u32 {
        self.defaults()
            .and_then(|d| d.nodes_per_tenant)
            .unwrap_or(DEFAULT_NODES_PER_TENANT)
    }

    /// Load-balancer IPs handed to a tenant when neither the request nor the
    /// provider config sizes it
    pub fn lb_pool_per_tenant(&self) -> u32 {
        self.defaults()
            .and_then(|d| d.lb_pool_per_tenant)
            .unwrap_or(DEFAULT_LB_POOL_PER_TENANT)
    }

    fn defaults(&self) -> Option<&TenantAllocationDefaults> {
        self.tenant_allocation.as_ref().and_then(|t| t.defaults.as_ref())
    }
}

/// Observed usage of a NetworkPool, written by the allocator after every change
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPoolStatus {
    /// Latest observations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Usable IPs (allocatable space, reserved ranges excluded)
    #[serde(rename = "totalIPs", default)]
    pub total_ips: u64,

    /// Currently allocated IPs
    #[serde(rename = "allocatedIPs", default)]
    pub allocated_ips: u64,

    /// Currently free IPs
    #[serde(rename = "availableIPs", default)]
    pub available_ips: u64,

    /// Number of live IPAllocations holding addresses from this pool
    #[serde(default)]
    pub allocation_count: u64,

    /// Share of free addresses outside the largest free block (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(max = 100))]
    pub fragmentation_percent: Option<u32>,

    /// Size of the largest contiguous free block
    #[serde(default)]
    pub largest_free_block: u64,

    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
