//! In-memory store for testing
//!
//! [`MockIpamStore`] keeps every object in memory and enforces the same
//! compare-and-swap rule as the API server: each write bumps a global
//! version counter and a write carrying a stale `resourceVersion` fails with
//! [`StoreError::Conflict`].

use crate::error::StoreError;
use crate::store::{IpamStore, ServiceBindingTracker};
use crds::{
    IPAllocation, IPAllocationSpec, IPAllocationStatus, NetworkPool, NetworkPoolSpec, NetworkPoolStatus, ProviderConfig,
    ProviderConfigSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn meta_key(meta: &ObjectMeta) -> String {
    key(
        meta.namespace.as_deref().unwrap_or("default"),
        meta.name.as_deref().unwrap_or_default(),
    )
}

/// Build object metadata for a test object
pub fn test_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Build a NetworkPool for tests
pub fn test_pool(namespace: &str, name: &str, spec: NetworkPoolSpec) -> NetworkPool {
    NetworkPool {
        metadata: test_meta(namespace, name),
        spec,
        status: None,
    }
}

/// Build an IPAllocation for tests
pub fn test_allocation(namespace: &str, name: &str, spec: IPAllocationSpec) -> IPAllocation {
    IPAllocation {
        metadata: test_meta(namespace, name),
        spec,
        status: None,
    }
}

/// Build a ProviderConfig for tests
pub fn test_provider_config(namespace: &str, name: &str, spec: ProviderConfigSpec) -> ProviderConfig {
    ProviderConfig {
        metadata: test_meta(namespace, name),
        spec,
    }
}

/// Mock store for testing
///
/// Clones share the same storage, so a test can keep a handle while the
/// controller under test owns another.
#[derive(Debug, Clone, Default)]
pub struct MockIpamStore {
    pools: Arc<Mutex<HashMap<String, NetworkPool>>>,
    allocations: Arc<Mutex<HashMap<String, IPAllocation>>>,
    providers: Arc<Mutex<HashMap<String, ProviderConfig>>>,
    version: Arc<Mutex<u64>>,
    allocation_writes: Arc<Mutex<u64>>,
    pool_writes: Arc<Mutex<u64>>,
    pending_pool_conflicts: Arc<Mutex<u32>>,
}

impl MockIpamStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        let mut version = lock(&self.version);
        *version += 1;
        version.to_string()
    }

    fn stamp(&self, meta: &mut ObjectMeta) {
        if meta.namespace.is_none() {
            meta.namespace = Some("default".to_string());
        }
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", self.next_version()));
        }
        if meta.generation.is_none() {
            meta.generation = Some(1);
        }
        meta.resource_version = Some(self.next_version());
    }

    /// Add a pool (for test setup), returning the stored object
    pub fn add_pool(&self, mut pool: NetworkPool) -> NetworkPool {
        self.stamp(&mut pool.metadata);
        lock(&self.pools).insert(meta_key(&pool.metadata), pool.clone());
        pool
    }

    /// Add an allocation (for test setup), returning the stored object
    pub fn add_allocation(&self, mut allocation: IPAllocation) -> IPAllocation {
        self.stamp(&mut allocation.metadata);
        lock(&self.allocations).insert(meta_key(&allocation.metadata), allocation.clone());
        allocation
    }

    /// Add a provider config (for test setup), returning the stored object
    pub fn add_provider_config(&self, mut provider: ProviderConfig) -> ProviderConfig {
        self.stamp(&mut provider.metadata);
        lock(&self.providers).insert(meta_key(&provider.metadata), provider.clone());
        provider
    }

    /// Current stored copy of a pool
    pub fn pool(&self, namespace: &str, name: &str) -> Option<NetworkPool> {
        lock(&self.pools).get(&key(namespace, name)).cloned()
    }

    /// Current stored copy of an allocation
    pub fn allocation(&self, namespace: &str, name: &str) -> Option<IPAllocation> {
        lock(&self.allocations).get(&key(namespace, name)).cloned()
    }

    /// Replace a pool's spec, bumping its generation like the API server does
    pub fn update_pool_spec(&self, namespace: &str, name: &str, spec: NetworkPoolSpec) -> Option<NetworkPool> {
        let version = self.next_version();
        let mut pools = lock(&self.pools);
        let pool = pools.get_mut(&key(namespace, name))?;
        pool.spec = spec;
        pool.metadata.generation = Some(pool.metadata.generation.unwrap_or(1) + 1);
        pool.metadata.resource_version = Some(version);
        Some(pool.clone())
    }

    /// Remove an allocation outright
    pub fn delete_allocation(&self, namespace: &str, name: &str) -> Option<IPAllocation> {
        lock(&self.allocations).remove(&key(namespace, name))
    }

    /// Set the deletion timestamp on an allocation, returning the updated copy
    pub fn mark_deleting(&self, namespace: &str, name: &str) -> Option<IPAllocation> {
        let version = self.next_version();
        let timestamp: Time = serde_json::from_value(serde_json::json!("2026-01-01T00:00:00Z")).ok()?;
        let mut allocations = lock(&self.allocations);
        let allocation = allocations.get_mut(&key(namespace, name))?;
        allocation.metadata.deletion_timestamp = Some(timestamp);
        allocation.metadata.resource_version = Some(version);
        Some(allocation.clone())
    }

    /// Make the next `count` pool status writes fail with a conflict
    pub fn inject_pool_conflicts(&self, count: u32) {
        *lock(&self.pending_pool_conflicts) = count;
    }

    /// Number of successful allocation status writes
    pub fn allocation_writes(&self) -> u64 {
        *lock(&self.allocation_writes)
    }

    /// Number of successful pool status writes
    pub fn pool_writes(&self) -> u64 {
        *lock(&self.pool_writes)
    }
}

fn check_version(stored: &ObjectMeta, incoming: &ObjectMeta, what: &str) -> Result<(), StoreError> {
    if stored.resource_version != incoming.resource_version {
        return Err(StoreError::Conflict(format!(
            "{what} {}: resourceVersion {:?} is stale (current {:?})",
            meta_key(stored),
            incoming.resource_version,
            stored.resource_version
        )));
    }
    Ok(())
}

#[async_trait::async_trait]
impl IpamStore for MockIpamStore {
    async fn get_pool(&self, namespace: &str, name: &str) -> Result<Option<NetworkPool>, StoreError> {
        Ok(self.pool(namespace, name))
    }

    async fn get_allocation(&self, namespace: &str, name: &str) -> Result<Option<IPAllocation>, StoreError> {
        Ok(self.allocation(namespace, name))
    }

    async fn list_allocations(&self, namespace: &str) -> Result<Vec<IPAllocation>, StoreError> {
        let allocations = lock(&self.allocations);
        let mut listed: Vec<IPAllocation> = allocations
            .values()
            .filter(|a| a.metadata.namespace.as_deref() == Some(namespace))
            .cloned()
            .collect();
        listed.sort_by_key(|a| meta_key(&a.metadata));
        Ok(listed)
    }

    async fn get_provider_config(&self, namespace: &str, name: &str) -> Result<Option<ProviderConfig>, StoreError> {
        Ok(lock(&self.providers).get(&key(namespace, name)).cloned())
    }

    async fn update_allocation_status(
        &self,
        allocation: &IPAllocation,
        status: &IPAllocationStatus,
    ) -> Result<IPAllocation, StoreError> {
        let version = self.next_version();
        let mut allocations = lock(&self.allocations);
        let stored = allocations
            .get_mut(&meta_key(&allocation.metadata))
            .ok_or_else(|| StoreError::NotFound(format!("IPAllocation {}", meta_key(&allocation.metadata))))?;
        check_version(&stored.metadata, &allocation.metadata, "IPAllocation")?;

        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        *lock(&self.allocation_writes) += 1;
        Ok(stored.clone())
    }

    async fn update_pool_status(&self, pool: &NetworkPool, status: &NetworkPoolStatus) -> Result<NetworkPool, StoreError> {
        {
            let mut pending = lock(&self.pending_pool_conflicts);
            if *pending > 0 {
                *pending -= 1;
                return Err(StoreError::Conflict(format!(
                    "NetworkPool {}: injected conflict",
                    meta_key(&pool.metadata)
                )));
            }
        }

        let version = self.next_version();
        let mut pools = lock(&self.pools);
        let stored = pools
            .get_mut(&meta_key(&pool.metadata))
            .ok_or_else(|| StoreError::NotFound(format!("NetworkPool {}", meta_key(&pool.metadata))))?;
        check_version(&stored.metadata, &pool.metadata, "NetworkPool")?;

        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        *lock(&self.pool_writes) += 1;
        Ok(stored.clone())
    }
}

/// Binding tracker with addresses set directly by the test
#[derive(Debug, Clone, Default)]
pub struct MockBindingTracker {
    bound: Arc<Mutex<HashMap<String, BTreeSet<Ipv4Addr>>>>,
}

impl MockBindingTracker {
    /// Create a tracker with no signals
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `addresses` as bound for the allocation `namespace/name`
    pub fn set_bound(&self, namespace: &str, name: &str, addresses: impl IntoIterator<Item = Ipv4Addr>) {
        lock(&self.bound).insert(key(namespace, name), addresses.into_iter().collect());
    }
}

#[async_trait::async_trait]
impl ServiceBindingTracker for MockBindingTracker {
    async fn bound_addresses(&self, allocation: &IPAllocation) -> Result<Option<BTreeSet<Ipv4Addr>>, StoreError> {
        Ok(lock(&self.bound).get(&meta_key(&allocation.metadata)).cloned())
    }
}
