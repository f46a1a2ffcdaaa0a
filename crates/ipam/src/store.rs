//! Persisted store seam
//!
//! The allocator never talks to the Kubernetes API directly. Everything it
//! reads or writes goes through [`IpamStore`], which the controller binary
//! implements with `kube::Api` and tests implement in memory.

use crate::error::StoreError;
use crds::{IPAllocation, IPAllocationStatus, NetworkPool, NetworkPoolStatus, ProviderConfig};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Object store with per-object optimistic concurrency
///
/// Status writes are compare-and-swap on `metadata.resourceVersion` of the
/// object passed in; a stale version fails with [`StoreError::Conflict`].
/// All methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait IpamStore: Send + Sync {
    /// Fetch a NetworkPool, `None` if it does not exist
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<Option<NetworkPool>, StoreError>;

    /// Fetch an IPAllocation, `None` if it does not exist
    async fn get_allocation(&self, namespace: &str, name: &str) -> Result<Option<IPAllocation>, StoreError>;

    /// List IPAllocations in a namespace
    async fn list_allocations(&self, namespace: &str) -> Result<Vec<IPAllocation>, StoreError>;

    /// Fetch a ProviderConfig, `None` if it does not exist
    async fn get_provider_config(&self, namespace: &str, name: &str) -> Result<Option<ProviderConfig>, StoreError>;

    /// Replace an IPAllocation's status, returning the updated object
    async fn update_allocation_status(
        &self,
        allocation: &IPAllocation,
        status: &IPAllocationStatus,
    ) -> Result<IPAllocation, StoreError>;

    /// Replace a NetworkPool's status, returning the updated object
    async fn update_pool_status(&self, pool: &NetworkPool, status: &NetworkPoolStatus) -> Result<NetworkPool, StoreError>;
}

/// Collaborator reporting which load-balancer addresses are bound to services
#[async_trait::async_trait]
pub trait ServiceBindingTracker: Send + Sync {
    /// Addresses of `allocation` currently in use.
    ///
    /// `None` means no signal is available, in which case the allocation is
    /// neither grown nor shrunk.
    async fn bound_addresses(&self, allocation: &IPAllocation) -> Result<Option<BTreeSet<Ipv4Addr>>, StoreError>;
}
