//! IPAllocation CRD
//!
//! Requests a block of node or load-balancer IPs from a NetworkPool on behalf
//! of a tenant cluster. The spec is immutable after creation; only the
//! allocator writes the status.

use crate::conditions::Condition;
use crate::references::{LocalObjectReference, NamespacedObjectReference, ProviderReference};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Finalizer guaranteeing addresses are released before the object disappears
pub const IP_ALLOCATION_FINALIZER: &str = "ipam.butlerlabs.dev/release";

/// Annotation carrying the addresses currently bound to load-balancer services
pub const BOUND_ADDRESSES_ANNOTATION: &str = "ipam.butlerlabs.dev/bound-addresses";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "butler.butlerlabs.dev",
    version = "v1alpha1",
    kind = "IPAllocation",
    namespaced,
    status = "IPAllocationStatus",
    shortname = "ipa",
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.poolRef.name","description":"Network pool"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.tenantClusterRef.name","description":"Tenant cluster"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type","description":"Allocation type"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase","description":"Allocation phase"}"#,
    printcolumn = r#"{"name":"Start","type":"string","jsonPath":".status.startAddress","description":"Start IP"}"#,
    printcolumn = r#"{"name":"End","type":"string","jsonPath":".status.endAddress","description":"End IP"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPAllocationSpec {
    /// NetworkPool to allocate from (same namespace as the IPAllocation)
    pub pool_ref: LocalObjectReference,

    /// TenantCluster this allocation is for
    pub tenant_cluster_ref: NamespacedObjectReference,

    /// Purpose of the allocation
    #[serde(rename = "type")]
    pub allocation_type: IPAllocationType,

    /// Number of IPs to allocate. Defaults from the pool or provider config.
    /// Mutually exclusive with `pinnedRange`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub count: Option<u32>,

    /// Exact range to allocate instead of automatic placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_range: Option<PinnedIPRange>,

    /// ProviderConfig supplying the ordered pool list and load-balancer sizing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<ProviderReference>,
}

/// Purpose of an IP allocation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum IPAllocationType {
    /// Worker and control-plane node IPs
    #[serde(rename = "nodes")]
    Nodes,

    /// Load balancer IPs
    #[serde(rename = "loadbalancer")]
    LoadBalancer,
}

impl fmt::Display for IPAllocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nodes => write!(f, "nodes"),
            Self::LoadBalancer => write!(f, "loadbalancer"),
        }
    }
}

/// Exact IP range to allocate
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PinnedIPRange {
    /// First IP of the pinned range
    #[schemars(regex(pattern = r"^(\d{1,3}\.){3}\d{1,3}$"))]
    pub start_address: String,

    /// Last IP of the pinned range
    #[schemars(regex(pattern = r"^(\d{1,3}\.){3}\d{1,3}$"))]
    pub end_address: String,
}

/// Allocation phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default, Hash)]
pub enum IPAllocationPhase {
    /// Waiting to be fulfilled
    #[default]
    Pending,

    /// IPs have been assigned
    Allocated,

    /// IPs have been returned to the pool
    Released,

    /// The request cannot be fulfilled
    Failed,
}

impl IPAllocationPhase {
    /// Released and Failed allocations never hold addresses again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Failed)
    }
}

impl fmt::Display for IPAllocationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Allocated => write!(f, "Allocated"),
            Self::Released => write!(f, "Released"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome of an IPAllocation, owned by the allocator
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IPAllocationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: IPAllocationPhase,

    /// Latest observations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Allocated range in CIDR notation, set only when power-of-two aligned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,

    /// First IP of the allocated block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_address: Option<String>,

    /// Last IP of the allocated block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_address: Option<String>,

    /// Every individual IP held by this allocation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    /// Number of IPs held
    #[serde(default)]
    pub allocated_count: u64,

    /// Last observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When IPs were assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<DateTime<Utc>>,

    /// Pool that fulfilled the allocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_by: Option<String>,

    /// When IPs were released
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

impl IPAllocation {
    /// `namespace/name` key identifying this allocation
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Current phase (Pending when no status has been written yet)
    pub fn phase(&self) -> IPAllocationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
