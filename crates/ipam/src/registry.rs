//! Per-pool single-writer registry
//!
//! Every `namespace/name` pool gets one `tokio::sync::Mutex` slot. Holding a
//! slot's guard is the only way to mutate that pool's free list, so requests
//! against the same pool are serialized while different pools proceed in
//! parallel. Multi-pool requests take their slots in key order.

use crate::address::{self, AddressRange};
use crate::error::IpamError;
use crate::pool::PoolAllocator;
use crds::{
    CONDITION_READY, Condition, ConditionStatus, IPAllocation, IPAllocationPhase, NetworkPool, NetworkPoolStatus, reasons,
    set_condition,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// `namespace/name` key for a pool or allocation
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Addresses recorded in an allocation's status, coalesced into ranges
pub fn recorded_ranges(allocation: &IPAllocation) -> Result<Vec<AddressRange>, IpamError> {
    let Some(status) = allocation.status.as_ref() else {
        return Ok(Vec::new());
    };
    let addresses = status
        .addresses
        .iter()
        .map(|s| AddressRange::parse_address(s))
        .collect::<Result<Vec<Ipv4Addr>, IpamError>>()?;
    Ok(address::coalesce(addresses))
}

/// A pool's allocator rebuilt from persisted state
#[derive(Debug)]
pub struct LoadedPool {
    /// Last stored copy of the pool, used as the CAS base for status writes
    pub pool: NetworkPool,
    /// Free-list state
    pub allocator: PoolAllocator,
    /// Allocation key to the ranges it owns in this pool
    pub owners: BTreeMap<String, Vec<AddressRange>>,
    /// Allocations whose recorded ranges collided with an earlier one
    pub conflicts: BTreeSet<String>,
}

impl LoadedPool {
    /// Seed the allocator from the pool spec and replay recorded holdings.
    ///
    /// Confirmed (`Allocated`) holdings are replayed before reservations that
    /// are still `Pending`, then oldest `allocatedAt` first, then by name. An
    /// allocation whose ranges cannot all be reserved owns nothing and is
    /// listed in `conflicts`.
    pub fn build(pool: NetworkPool, allocations: &[IPAllocation]) -> Result<Self, IpamError> {
        let name = pool.metadata.name.clone().unwrap_or_default();
        let namespace = pool.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let mut allocator = PoolAllocator::from_spec(&name, &pool.spec)?;

        let mut holders: Vec<&IPAllocation> = allocations
            .iter()
            .filter(|a| a.metadata.namespace.as_deref().unwrap_or("default") == namespace)
            .filter(|a| !a.phase().is_terminal())
            .filter(|a| {
                a.status
                    .as_ref()
                    .is_some_and(|s| !s.addresses.is_empty() && s.allocated_by.as_deref() == Some(name.as_str()))
            })
            .collect();
        holders.sort_by(|a, b| {
            let unconfirmed = |x: &IPAllocation| x.phase() != IPAllocationPhase::Allocated;
            let at = |x: &IPAllocation| x.status.as_ref().and_then(|s| s.allocated_at);
            unconfirmed(a)
                .cmp(&unconfirmed(b))
                .then_with(|| at(a).cmp(&at(b)))
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });

        let mut owners = BTreeMap::new();
        let mut conflicts = BTreeSet::new();
        for allocation in holders {
            let key = allocation.key();
            match recorded_ranges(allocation).and_then(|ranges| reserve_all(&mut allocator, &ranges).map(|()| ranges)) {
                Ok(ranges) => {
                    owners.insert(key, ranges);
                }
                Err(e) => {
                    warn!(pool = %name, allocation = %key, error = %e, "Recorded addresses collide, leaving allocation unowned");
                    conflicts.insert(key);
                }
            }
        }

        debug!(
            pool = %name,
            owners = owners.len(),
            conflicts = conflicts.len(),
            allocated = allocator.allocated_ips(),
            "Rebuilt pool from recorded allocations"
        );
        Ok(Self {
            pool,
            allocator,
            owners,
            conflicts,
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        self.allocator.name()
    }

    /// Generation the allocator was built from
    pub fn generation(&self) -> Option<i64> {
        self.pool.metadata.generation
    }

    /// Take ownership of `ranges` for `key`, replacing anything it held.
    ///
    /// Fails without changing state if any range is outside the pool or not
    /// free.
    pub fn adopt(&mut self, key: &str, ranges: &[AddressRange]) -> Result<(), IpamError> {
        let previous = self.owners.remove(key).unwrap_or_default();
        for range in &previous {
            self.allocator.release(*range);
        }
        if let Err(e) = reserve_all(&mut self.allocator, ranges) {
            // Put the previous holding back; it was reserved a moment ago
            if reserve_all(&mut self.allocator, &previous).is_ok() && !previous.is_empty() {
                self.owners.insert(key.to_string(), previous);
            }
            return Err(e);
        }
        self.conflicts.remove(key);
        self.owners.insert(key.to_string(), ranges.to_vec());
        Ok(())
    }

    /// Release everything `key` owns, returning the number of addresses freed
    pub fn release_owner(&mut self, key: &str) -> u64 {
        self.conflicts.remove(key);
        self.owners
            .remove(key)
            .map_or(0, |ranges| ranges.iter().map(|range| self.allocator.release(*range)).sum())
    }

    /// Status the pool should carry for the current state
    pub fn desired_status(&self) -> NetworkPoolStatus {
        let generation = self.generation();
        let mut status = self.allocator.recompute_status(self.owners.len() as u64);
        status.observed_generation = generation;
        status.conditions = self
            .pool
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();

        let condition = if self.conflicts.is_empty() {
            Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                reasons::POOL_READY,
                format!("{} of {} addresses allocated", status.allocated_ips, status.total_ips),
                generation,
            )
        } else {
            let keys: Vec<&str> = self.conflicts.iter().map(String::as_str).collect();
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                reasons::ALLOCATION_CONFLICT,
                format!("Recorded addresses of {} collide with earlier allocations", keys.join(", ")),
                generation,
            )
        };
        set_condition(&mut status.conditions, condition);
        status
    }
}

fn reserve_all(allocator: &mut PoolAllocator, ranges: &[AddressRange]) -> Result<(), IpamError> {
    for (index, range) in ranges.iter().enumerate() {
        if let Err(e) = allocator.allocate_pinned(*range) {
            for reserved in &ranges[..index] {
                allocator.release(*reserved);
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Cached state of one pool
#[derive(Debug, Default)]
pub struct PoolSlot {
    /// Built allocator, if the pool has been loaded
    pub loaded: Option<LoadedPool>,
    /// Force a rebuild on next use
    pub invalidated: bool,
}

impl PoolSlot {
    /// Whether the cached state still matches the stored `pool`.
    ///
    /// Any write to the pool other than this slot's own, including another
    /// replica's status update, changes its `resourceVersion` and forces a
    /// rebuild.
    pub fn is_fresh(&self, pool: &NetworkPool) -> bool {
        !self.invalidated
            && self.loaded.as_ref().is_some_and(|l| {
                l.generation() == pool.metadata.generation
                    && l.pool.metadata.resource_version == pool.metadata.resource_version
            })
    }

    /// Drop the cached state so the next writer rebuilds it
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }
}

/// Locked slot together with its pool key
pub type LockedSlot = (String, OwnedMutexGuard<PoolSlot>);

/// Registry of per-pool slots
#[derive(Debug, Default)]
pub struct PoolRegistry {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<PoolSlot>>>>,
}

impl PoolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<PoolSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.to_string()).or_default())
    }

    /// Lock the slots for `keys`, deduplicated and in sorted order
    pub async fn lock(&self, keys: &[String]) -> Vec<LockedSlot> {
        let ordered: BTreeSet<&String> = keys.iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            let guard = self.slot(key).lock_owned().await;
            guards.push((key.clone(), guard));
        }
        guards
    }

    /// Lock a single slot
    pub async fn lock_one(&self, key: &str) -> OwnedMutexGuard<PoolSlot> {
        self.slot(key).lock_owned().await
    }

    /// Forget a pool that no longer exists
    pub fn forget(&self, key: &str) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Number of pools with a slot
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no pool has a slot
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{test_allocation, test_pool};
    use chrono::{Duration, Utc};
    use crds::{IPAllocationSpec, IPAllocationStatus, IPAllocationType, LocalObjectReference, NetworkPoolSpec};

    fn pool() -> NetworkPool {
        let mut pool = test_pool(
            "infra",
            "dc1",
            NetworkPoolSpec {
                cidr: "10.0.0.0/24".into(),
                ..Default::default()
            },
        );
        pool.metadata.generation = Some(1);
        pool
    }

    fn held(name: &str, addresses: &[&str], minutes_ago: i64) -> IPAllocation {
        let mut allocation = test_allocation(
            "infra",
            name,
            IPAllocationSpec {
                pool_ref: LocalObjectReference::new("dc1"),
                tenant_cluster_ref: Default::default(),
                allocation_type: IPAllocationType::Nodes,
                count: None,
                pinned_range: None,
                provider_config_ref: None,
            },
        );
        allocation.status = Some(IPAllocationStatus {
            phase: IPAllocationPhase::Allocated,
            addresses: addresses.iter().map(|s| s.to_string()).collect(),
            allocated_by: Some("dc1".into()),
            allocated_at: Some(Utc::now() - Duration::minutes(minutes_ago)),
            ..Default::default()
        });
        allocation
    }

    #[test]
    fn test_rebuild_replays_oldest_first_and_reports_collisions() {
        let older = held("older", &["10.0.0.8", "10.0.0.9"], 10);
        let newer = held("newer", &["10.0.0.9", "10.0.0.10"], 1);
        let disjoint = held("disjoint", &["10.0.0.20"], 5);

        let loaded = LoadedPool::build(pool(), &[newer, disjoint, older]).unwrap();
        assert_eq!(loaded.owners.len(), 2);
        assert!(loaded.owners.contains_key("infra/older"));
        assert!(loaded.conflicts.contains("infra/newer"));
        assert_eq!(loaded.allocator.allocated_ips(), 3);

        let status = loaded.desired_status();
        assert_eq!(status.allocation_count, 2);
        assert_eq!(status.conditions[0].reason, reasons::ALLOCATION_CONFLICT);
    }

    #[test]
    fn test_confirmed_holding_beats_older_pending_reservation() {
        let mut reserving = held("reserving", &["10.0.0.8", "10.0.0.9"], 10);
        if let Some(status) = reserving.status.as_mut() {
            status.phase = IPAllocationPhase::Pending;
        }
        let confirmed = held("confirmed", &["10.0.0.9"], 1);

        let loaded = LoadedPool::build(pool(), &[reserving, confirmed]).unwrap();
        assert!(loaded.owners.contains_key("infra/confirmed"));
        assert!(loaded.conflicts.contains("infra/reserving"));
    }

    #[test]
    fn test_slot_goes_stale_on_foreign_write() {
        let mut stored = pool();
        stored.metadata.resource_version = Some("7".into());
        let slot = PoolSlot {
            loaded: Some(LoadedPool::build(stored.clone(), &[]).unwrap()),
            invalidated: false,
        };
        assert!(slot.is_fresh(&stored));

        stored.metadata.resource_version = Some("8".into());
        assert!(!slot.is_fresh(&stored));
    }

    #[test]
    fn test_rebuild_ignores_released_allocations() {
        let mut released = held("gone", &["10.0.0.8"], 3);
        if let Some(status) = released.status.as_mut() {
            status.phase = IPAllocationPhase::Released;
        }
        let loaded = LoadedPool::build(pool(), &[released]).unwrap();
        assert!(loaded.owners.is_empty());
        assert_eq!(loaded.allocator.allocated_ips(), 0);
        assert_eq!(loaded.desired_status().conditions[0].reason, reasons::POOL_READY);
    }

    #[test]
    fn test_adopt_is_all_or_nothing() {
        let mut loaded = LoadedPool::build(pool(), &[held("a", &["10.0.0.5"], 1)]).unwrap();
        let wanted = [
            AddressRange::parse_range("10.0.0.1", "10.0.0.2").unwrap(),
            AddressRange::parse_range("10.0.0.4", "10.0.0.6").unwrap(),
        ];
        assert!(loaded.adopt("infra/b", &wanted).is_err());
        assert_eq!(loaded.allocator.allocated_ips(), 1);

        assert_eq!(loaded.release_owner("infra/a"), 1);
        loaded.adopt("infra/b", &wanted).unwrap();
        assert_eq!(loaded.allocator.allocated_ips(), 5);
    }

    #[tokio::test]
    async fn test_lock_orders_and_dedups_keys() {
        let registry = PoolRegistry::new();
        let keys = vec!["ns/b".to_string(), "ns/a".to_string(), "ns/b".to_string()];
        let guards = registry.lock(&keys).await;
        let locked: Vec<&str> = guards.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(locked, vec!["ns/a", "ns/b"]);
        assert_eq!(registry.len(), 2);
    }
}
