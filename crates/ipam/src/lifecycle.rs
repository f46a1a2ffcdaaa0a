//! Allocation lifecycle
//!
//! Drives each IPAllocation through `Pending -> Allocated | Failed` and
//! `Allocated -> Released`. This is the only layer that decides between
//! retrying and failing, and the only one that writes conditions.
//!
//! A new reservation is committed in three writes: the range is recorded on
//! the still-`Pending` allocation, the debited pool status is written with
//! compare-and-swap against the version the slot was built from, and only
//! then does the allocation become `Allocated`. Two replicas working from the
//! same pool version cannot both win the pool write; the loser withdraws its
//! reservation, rebuilds and selects again.

use crate::address::AddressRange;
use crate::elastic::{ElasticSizer, ResizePlan, apply_resize};
use crate::error::{IpamError, StoreError};
use crate::registry::{LoadedPool, LockedSlot, PoolRegistry, PoolSlot, object_key, recorded_ranges};
use crate::selector::{AllocationRequest, PoolCandidate, PriorityPoolSelector, Selection};
use crate::store::{IpamStore, ServiceBindingTracker};
use chrono::Utc;
use crds::{
    CONDITION_CAPACITY, CONDITION_READY, Condition, ConditionStatus, IPAllocation, IPAllocationPhase,
    IPAllocationStatus, IPAllocationType, ProviderConfig, reasons, set_condition,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a reconcile pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Addresses were reserved and recorded
    Allocated {
        /// Pool that satisfied the request
        pool: String,
        /// Range reserved
        range: AddressRange,
    },
    /// The recorded holding was verified, nothing changed
    AlreadyAllocated,
    /// An elastic holding grew or shrank
    Resized {
        /// Addresses added
        added: u64,
        /// Addresses given back
        removed: u64,
    },
    /// Not satisfiable yet, retry later
    Waiting {
        /// Condition reason
        reason: String,
        /// Condition message
        message: String,
    },
    /// Terminal failure recorded on the allocation
    Failed {
        /// Condition reason
        reason: String,
        /// Condition message
        message: String,
    },
    /// Addresses returned to the pool
    Released {
        /// Number of addresses freed
        freed: u64,
    },
    /// The allocation disappeared while it was being served
    Cancelled,
    /// Nothing to do
    Unchanged,
}

impl ReconcileOutcome {
    /// Whether the caller should retry with backoff
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }

    /// Short lowercase name, used as a metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocated { .. } => "allocated",
            Self::AlreadyAllocated => "already_allocated",
            Self::Resized { .. } => "resized",
            Self::Waiting { .. } => "waiting",
            Self::Failed { .. } => "failed",
            Self::Released { .. } => "released",
            Self::Cancelled => "cancelled",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Request shape after validation, before the count is defaulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestShape {
    Count(Option<u64>),
    Pinned(AddressRange),
}

/// Attempts at winning the pool write before giving up to backoff
const COMMIT_ATTEMPTS: usize = 3;

/// Result of one pass at committing a reservation
#[derive(Debug)]
enum Commit {
    Done(ReconcileOutcome),
    /// The pool changed underneath; the slot is invalidated
    Lost,
}

/// A candidate pool resolved from the request
#[derive(Debug, Clone, PartialEq, Eq)]
struct CandidateRef {
    key: String,
    name: String,
    priority: i32,
}

/// Reconciles IPAllocations against pools
pub struct LifecycleController {
    store: Arc<dyn IpamStore>,
    registry: PoolRegistry,
    bindings: Option<Arc<dyn ServiceBindingTracker>>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("pools", &self.registry.len())
            .field("elastic", &self.bindings.is_some())
            .finish_non_exhaustive()
    }
}

fn namespace_of(allocation: &IPAllocation) -> &str {
    allocation.metadata.namespace.as_deref().unwrap_or("default")
}

fn name_of(allocation: &IPAllocation) -> &str {
    allocation.metadata.name.as_deref().unwrap_or_default()
}

fn has_holding(allocation: &IPAllocation) -> bool {
    allocation
        .status
        .as_ref()
        .is_some_and(|s| !s.addresses.is_empty())
}

/// Validate the request shape without consulting any pool
fn request_shape(allocation: &IPAllocation) -> Result<RequestShape, IpamError> {
    let spec = &allocation.spec;
    match (spec.count, spec.pinned_range.as_ref()) {
        (Some(_), Some(_)) => Err(IpamError::InvalidRequest(
            "count and pinnedRange are mutually exclusive".to_string(),
        )),
        (Some(0), None) => Err(IpamError::InvalidRequest("count must be at least 1".to_string())),
        (count, None) => Ok(RequestShape::Count(count.map(u64::from))),
        (None, Some(pinned)) => {
            AddressRange::parse_range(&pinned.start_address, &pinned.end_address).map(RequestShape::Pinned)
        }
    }
}

/// Write the holding fields of `status` for `ranges`
fn record_holding(status: &mut IPAllocationStatus, ranges: &[AddressRange]) {
    let primary = ranges.first();
    status.start_address = primary.map(|r| r.start_addr().to_string());
    status.end_address = primary.map(|r| r.end_addr().to_string());
    status.cidr = match ranges {
        [only] => only.to_cidr(),
        _ => None,
    };
    status.addresses = ranges
        .iter()
        .flat_map(AddressRange::addresses)
        .map(|ip| ip.to_string())
        .collect();
    status.allocated_count = crate::address::total_len(ranges);
}

fn clear_holding(status: &mut IPAllocationStatus) {
    status.cidr = None;
    status.start_address = None;
    status.end_address = None;
    status.addresses.clear();
    status.allocated_count = 0;
    status.allocated_at = None;
    status.allocated_by = None;
}

impl LifecycleController {
    /// Controller over `store` with a fresh registry
    pub fn new(store: Arc<dyn IpamStore>) -> Self {
        Self {
            store,
            registry: PoolRegistry::new(),
            bindings: None,
        }
    }

    /// Enable elastic load-balancer sizing driven by `tracker`
    #[must_use]
    pub fn with_binding_tracker(mut self, tracker: Arc<dyn ServiceBindingTracker>) -> Self {
        self.bindings = Some(tracker);
        self
    }

    /// Per-pool registry
    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Reconcile one allocation
    ///
    /// Store failures are returned as errors. Waiting and terminal failures
    /// are recorded on the allocation and returned as outcomes.
    pub async fn reconcile(&self, allocation: &IPAllocation) -> Result<ReconcileOutcome, IpamError> {
        if allocation.is_deleting() {
            return self.release(allocation).await;
        }

        let phase = allocation.phase();
        if phase.is_terminal() {
            debug!(allocation = %allocation.key(), %phase, "Allocation is terminal, skipping");
            return Ok(ReconcileOutcome::Unchanged);
        }

        if has_holding(allocation) {
            return self.verify_holding(allocation).await;
        }

        match self.allocate(allocation).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.record_failure(allocation, e).await,
        }
    }

    /// Turn an allocation error into a recorded condition
    async fn record_failure(&self, allocation: &IPAllocation, err: IpamError) -> Result<ReconcileOutcome, IpamError> {
        let reason = err.reason().to_string();
        let message = err.to_string();

        if let IpamError::Store(_) = err {
            warn!(allocation = %allocation.key(), error = %err, "Store failure during allocation");
            return Err(err);
        }

        let transient = err.is_transient();
        let mut status = allocation.status.clone().unwrap_or_default();
        status.phase = if transient {
            IPAllocationPhase::Pending
        } else {
            IPAllocationPhase::Failed
        };
        status.observed_generation = allocation.metadata.generation;
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                &reason,
                message.clone(),
                allocation.metadata.generation,
            ),
        );

        if transient {
            warn!(allocation = %allocation.key(), %reason, %message, "Allocation is waiting");
        } else {
            error!(allocation = %allocation.key(), %reason, %message, "Allocation failed");
        }

        if allocation.status.as_ref() != Some(&status) {
            self.store.update_allocation_status(allocation, &status).await?;
        }

        Ok(if transient {
            ReconcileOutcome::Waiting { reason, message }
        } else {
            ReconcileOutcome::Failed { reason, message }
        })
    }

    async fn provider_config(&self, allocation: &IPAllocation) -> Result<Option<ProviderConfig>, IpamError> {
        let Some(reference) = allocation.spec.provider_config_ref.as_ref() else {
            return Ok(None);
        };
        let namespace = reference.namespace_or(namespace_of(allocation));
        match self.store.get_provider_config(namespace, &reference.name).await? {
            Some(provider) => Ok(Some(provider)),
            None => Err(IpamError::PoolNotFound(format!(
                "ProviderConfig {}",
                object_key(namespace, &reference.name)
            ))),
        }
    }

    fn candidates(allocation: &IPAllocation, provider: Option<&ProviderConfig>) -> Vec<CandidateRef> {
        let namespace = namespace_of(allocation);
        let listed = provider
            .and_then(|p| p.spec.network.as_ref())
            .map(|n| n.pool_refs.as_slice())
            .unwrap_or_default();

        if listed.is_empty() {
            let name = allocation.spec.pool_ref.name.clone();
            return vec![CandidateRef {
                key: object_key(namespace, &name),
                name,
                priority: 0,
            }];
        }
        listed
            .iter()
            .map(|r| CandidateRef {
                key: object_key(namespace, &r.name),
                name: r.name.clone(),
                priority: r.priority,
            })
            .collect()
    }

    /// Make sure `slot` holds an allocator consistent with the stored pool
    async fn load(&self, slot: &mut PoolSlot, namespace: &str, name: &str) -> Result<(), IpamError> {
        let Some(pool) = self.store.get_pool(namespace, name).await? else {
            slot.loaded = None;
            return Err(IpamError::PoolNotFound(format!("NetworkPool {}", object_key(namespace, name))));
        };

        if slot.is_fresh(&pool) {
            return Ok(());
        }

        let allocations = self.store.list_allocations(namespace).await?;
        match LoadedPool::build(pool, &allocations) {
            Ok(loaded) => {
                slot.loaded = Some(loaded);
                slot.invalidated = false;
                Ok(())
            }
            Err(e) => {
                slot.loaded = None;
                Err(e)
            }
        }
    }

    /// Write the pool's status if it changed
    async fn publish(&self, slot: &mut PoolSlot) -> Result<(), StoreError> {
        let unchanged = slot
            .loaded
            .as_ref()
            .is_none_or(|l| l.pool.status.as_ref() == Some(&l.desired_status()));
        if unchanged {
            return Ok(());
        }
        self.claim(slot).await
    }

    /// Write the pool's status against the version the slot was built from.
    ///
    /// Written even when unchanged, so a stale slot always loses. A lost CAS
    /// invalidates the slot.
    async fn claim(&self, slot: &mut PoolSlot) -> Result<(), StoreError> {
        let Some(loaded) = slot.loaded.as_mut() else {
            return Ok(());
        };
        let status = loaded.desired_status();
        match self.store.update_pool_status(&loaded.pool, &status).await {
            Ok(updated) => {
                loaded.pool = updated;
                Ok(())
            }
            Err(e) => {
                debug!(pool = loaded.name(), error = %e, "Pool status write lost, invalidating slot");
                slot.invalidate();
                Err(e)
            }
        }
    }

    async fn publish_logged(&self, slot: &mut PoolSlot) {
        if let Err(e) = self.publish(slot).await {
            warn!(error = %e, "Failed to update pool status, it will be rebuilt");
        }
    }

    fn default_count(
        allocation: &IPAllocation,
        provider: Option<&ProviderConfig>,
        primary: &LoadedPool,
    ) -> u64 {
        let spec = &primary.pool.spec;
        let count = match allocation.spec.allocation_type {
            IPAllocationType::Nodes => spec.nodes_per_tenant(),
            IPAllocationType::LoadBalancer => provider
                .and_then(|p| p.spec.network.as_ref())
                .and_then(|n| n.load_balancer.as_ref())
                .map_or_else(|| spec.lb_pool_per_tenant(), |lb| lb.starting_size()),
        };
        u64::from(count)
    }

    async fn check_quota(
        &self,
        allocation: &IPAllocation,
        provider: Option<&ProviderConfig>,
        requested: u64,
    ) -> Result<(), IpamError> {
        let Some(quota) = provider
            .and_then(|p| p.spec.network.as_ref())
            .and_then(|n| n.quota_per_tenant.as_ref())
        else {
            return Ok(());
        };
        let kind = allocation.spec.allocation_type;
        let limit = match kind {
            IPAllocationType::Nodes => quota.max_node_ips,
            IPAllocationType::LoadBalancer => quota.max_load_balancer_ips,
        };
        let Some(limit) = limit else {
            return Ok(());
        };

        let namespace = namespace_of(allocation);
        let tenant = allocation.spec.tenant_cluster_ref.key(namespace);
        let own_key = allocation.key();
        let held: u64 = self
            .store
            .list_allocations(namespace)
            .await?
            .iter()
            .filter(|a| a.key() != own_key && !a.phase().is_terminal())
            .filter(|a| a.spec.allocation_type == kind && a.spec.tenant_cluster_ref.key(namespace) == tenant)
            .filter_map(|a| a.status.as_ref().map(|s| s.allocated_count))
            .sum();

        if held + requested > limit {
            return Err(IpamError::QuotaExceeded(format!(
                "tenant {tenant} holds {held} {kind} addresses, {requested} more would exceed the limit of {limit}"
            )));
        }
        Ok(())
    }

    /// `Pending -> Allocated`
    async fn allocate(&self, allocation: &IPAllocation) -> Result<ReconcileOutcome, IpamError> {
        let shape = request_shape(allocation)?;
        let provider = self.provider_config(allocation).await?;
        let candidates = Self::candidates(allocation, provider.as_ref());
        let keys: Vec<String> = candidates.iter().map(|c| c.key.clone()).collect();

        let mut guards = self.registry.lock(&keys).await;
        for attempt in 1..=COMMIT_ATTEMPTS {
            match self
                .try_allocate(allocation, shape, provider.as_ref(), &candidates, &mut guards)
                .await?
            {
                Commit::Done(outcome) => return Ok(outcome),
                Commit::Lost => {
                    debug!(allocation = %allocation.key(), attempt, "Pool changed during commit, selecting again");
                }
            }
        }
        Err(IpamError::Store(StoreError::Conflict(format!(
            "pool status of {} kept changing during commit",
            keys.join(", ")
        ))))
    }

    /// One selection and commit pass over the locked candidate slots
    async fn try_allocate(
        &self,
        allocation: &IPAllocation,
        shape: RequestShape,
        provider: Option<&ProviderConfig>,
        candidates: &[CandidateRef],
        guards: &mut [LockedSlot],
    ) -> Result<Commit, IpamError> {
        let namespace = namespace_of(allocation);
        let keys = || candidates.iter().map(|c| c.key.as_str()).collect::<Vec<_>>().join(", ");

        let mut first_error = None;
        for (key, guard) in guards.iter_mut() {
            let Some(candidate) = candidates.iter().find(|c| c.key == *key) else {
                continue;
            };
            if let Err(e) = self.load(guard, namespace, &candidate.name).await {
                if let IpamError::Store(_) = e {
                    return Err(e);
                }
                warn!(pool = %key, error = %e, "Skipping candidate pool");
                first_error.get_or_insert(e);
            }
        }

        // Pair every loaded slot with its position in the request's pool list
        let mut loaded: Vec<(usize, i32, &mut PoolSlot)> = guards
            .iter_mut()
            .filter_map(|(key, guard)| {
                let position = candidates.iter().position(|c| c.key == *key)?;
                let slot: &mut PoolSlot = guard;
                slot.loaded.is_some().then_some((position, candidates[position].priority, slot))
            })
            .collect();
        if loaded.is_empty() {
            return Err(first_error.unwrap_or_else(|| IpamError::PoolNotFound(keys())));
        }
        loaded.sort_by_key(|(position, _, _)| *position);

        // A pinned range no loaded pool can hold may belong to one that failed to load
        if let RequestShape::Pinned(range) = shape {
            let placeable = loaded
                .iter()
                .any(|(_, _, slot)| slot.loaded.as_ref().is_some_and(|l| l.allocator.cidr().contains(&range)));
            match first_error {
                Some(e) if !placeable => return Err(e),
                _ => {}
            }
        }

        let request = match shape {
            RequestShape::Pinned(range) => AllocationRequest::Pinned(range),
            RequestShape::Count(Some(count)) => AllocationRequest::Count(count),
            RequestShape::Count(None) => {
                let primary = loaded
                    .iter()
                    .filter_map(|(_, _, slot)| slot.loaded.as_ref())
                    .find(|l| l.name() == allocation.spec.pool_ref.name)
                    .or_else(|| loaded.iter().find_map(|(_, _, slot)| slot.loaded.as_ref()));
                match primary {
                    Some(primary) => AllocationRequest::Count(Self::default_count(allocation, provider, primary)),
                    None => return Err(IpamError::PoolNotFound(keys())),
                }
            }
        };
        let requested = match request {
            AllocationRequest::Count(count) => count,
            AllocationRequest::Pinned(range) => range.len(),
        };
        self.check_quota(allocation, provider, requested).await?;

        let selection = {
            let mut offered: Vec<PoolCandidate<'_>> = loaded
                .iter_mut()
                .filter_map(|(_, priority, slot)| {
                    slot.loaded.as_mut().map(|l| PoolCandidate {
                        priority: *priority,
                        pool: &mut l.allocator,
                    })
                })
                .collect();
            PriorityPoolSelector::select(&mut offered, request)?
        };

        let Some(slot) = loaded
            .into_iter()
            .map(|(_, _, slot)| slot)
            .find(|slot| slot.loaded.as_ref().is_some_and(|l| l.name() == selection.pool))
        else {
            return Err(IpamError::PoolNotFound(selection.pool));
        };
        self.commit(allocation, slot, selection).await
    }

    /// Record a fresh reservation, win the pool write, then confirm it
    async fn commit(&self, allocation: &IPAllocation, slot: &mut PoolSlot, selection: Selection) -> Result<Commit, IpamError> {
        let Selection { pool, range } = selection;
        let key = allocation.key();
        let undo = |slot: &mut PoolSlot| {
            if let Some(loaded) = slot.loaded.as_mut() {
                loaded.owners.remove(&key);
                loaded.allocator.release(range);
            }
        };

        // The request may have been deleted or recreated while we waited
        let fresh = match self
            .store
            .get_allocation(namespace_of(allocation), name_of(allocation))
            .await
        {
            Ok(fresh) => fresh,
            Err(e) => {
                undo(slot);
                return Err(e.into());
            }
        };
        let Some(fresh) = fresh.filter(|f| !f.is_deleting() && f.metadata.uid == allocation.metadata.uid) else {
            undo(slot);
            info!(allocation = %key, %range, "Allocation went away before commit, reservation dropped");
            return Ok(Commit::Done(ReconcileOutcome::Cancelled));
        };
        if has_holding(&fresh) {
            undo(slot);
            debug!(allocation = %key, "Allocation already holds addresses");
            return Ok(Commit::Done(ReconcileOutcome::AlreadyAllocated));
        }

        let previous = fresh.status.clone().unwrap_or_default();
        let mut status = previous.clone();
        record_holding(&mut status, &[range]);
        status.allocated_at = Some(Utc::now());
        status.allocated_by = Some(pool.clone());
        status.released_at = None;

        let reserved = match self.store.update_allocation_status(&fresh, &status).await {
            Ok(reserved) => reserved,
            Err(e) => {
                undo(slot);
                warn!(allocation = %key, error = %e, "Failed to record reservation, dropped");
                return Err(e.into());
            }
        };

        if let Some(loaded) = slot.loaded.as_mut() {
            loaded.owners.insert(key.clone(), vec![range]);
        }
        if let Err(e) = self.claim(slot).await {
            undo(slot);
            self.withdraw(&reserved, &previous).await;
            return match e {
                StoreError::Conflict(_) => {
                    debug!(allocation = %key, %range, error = %e, "Lost the pool write, reservation withdrawn");
                    Ok(Commit::Lost)
                }
                e => Err(e.into()),
            };
        }

        self.confirm(&reserved, status, &pool, range).await?;
        info!(allocation = %key, %pool, %range, "Allocated addresses");
        Ok(Commit::Done(ReconcileOutcome::Allocated { pool, range }))
    }

    /// Move a reservation whose pool write succeeded to `Allocated`
    async fn confirm(
        &self,
        reserved: &IPAllocation,
        mut status: IPAllocationStatus,
        pool: &str,
        range: AddressRange,
    ) -> Result<(), IpamError> {
        status.phase = IPAllocationPhase::Allocated;
        status.observed_generation = reserved.metadata.generation;
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                reasons::ALLOCATED,
                format!("Allocated {} addresses ({range}) from {pool}", status.allocated_count),
                reserved.metadata.generation,
            ),
        );
        if let Err(e) = self.store.update_allocation_status(reserved, &status).await {
            warn!(allocation = %reserved.key(), error = %e, "Reservation stands but is not yet confirmed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Put back the status an allocation had before a reservation that lost its pool write
    async fn withdraw(&self, reserved: &IPAllocation, previous: &IPAllocationStatus) {
        if let Err(e) = self.store.update_allocation_status(reserved, previous).await {
            warn!(
                allocation = %reserved.key(),
                error = %e,
                "Could not withdraw reservation, the next rebuild resolves it"
            );
        }
    }

    /// Finish a reservation that was recorded but not confirmed
    async fn promote(
        &self,
        allocation: &IPAllocation,
        slot: &mut PoolSlot,
        pool: &str,
        ranges: &[AddressRange],
    ) -> Result<ReconcileOutcome, IpamError> {
        let key = allocation.key();
        let fresh = self
            .store
            .get_allocation(namespace_of(allocation), name_of(allocation))
            .await?;
        let Some(fresh) = fresh.filter(|f| f.metadata.resource_version == allocation.metadata.resource_version) else {
            // Changed since this copy was read; its own event follows
            if let Some(loaded) = slot.loaded.as_mut() {
                loaded.release_owner(&key);
            }
            return Ok(ReconcileOutcome::Unchanged);
        };
        let Some(primary) = ranges.first().copied() else {
            return Ok(ReconcileOutcome::Unchanged);
        };

        self.claim(slot).await?;
        let status = fresh.status.clone().unwrap_or_default();
        self.confirm(&fresh, status, pool, primary).await?;
        info!(allocation = %key, %pool, range = %primary, "Confirmed recorded reservation");
        Ok(ReconcileOutcome::Allocated {
            pool: pool.to_string(),
            range: primary,
        })
    }

    /// Confirm a recorded holding is owned, adopting or resetting it as needed
    async fn verify_holding(&self, allocation: &IPAllocation) -> Result<ReconcileOutcome, IpamError> {
        let namespace = namespace_of(allocation);
        let key = allocation.key();
        let pool_name = allocation
            .status
            .as_ref()
            .and_then(|s| s.allocated_by.clone())
            .unwrap_or_else(|| allocation.spec.pool_ref.name.clone());

        let mut guard = self.registry.lock_one(&object_key(namespace, &pool_name)).await;
        let slot: &mut PoolSlot = &mut guard;
        self.load(slot, namespace, &pool_name).await?;

        let ranges = recorded_ranges(allocation);
        let verdict = match (slot.loaded.as_mut(), ranges.as_ref()) {
            (Some(loaded), Ok(ranges)) => {
                if loaded.owners.get(&key) == Some(ranges) {
                    Ok(false)
                } else {
                    loaded.adopt(&key, ranges).map(|()| true)
                }
            }
            (_, Err(e)) => Err(e.clone()),
            (None, Ok(_)) => Err(IpamError::PoolNotFound(pool_name.clone())),
        };

        match verdict {
            Ok(adopted) => {
                if adopted {
                    debug!(allocation = %key, pool = %pool_name, "Adopted recorded addresses");
                    self.publish_logged(slot).await;
                }
            }
            Err(e) => return self.reset_to_pending(allocation, slot, &e).await,
        }

        let ranges = ranges.unwrap_or_default();
        if allocation.phase() != IPAllocationPhase::Allocated {
            return self.promote(allocation, slot, &pool_name, &ranges).await;
        }
        if allocation.spec.allocation_type == IPAllocationType::LoadBalancer && self.bindings.is_some() {
            return self.resize(allocation, slot, &ranges).await;
        }
        Ok(ReconcileOutcome::AlreadyAllocated)
    }

    /// Drop a holding that collides with another allocation so it allocates afresh
    async fn reset_to_pending(
        &self,
        allocation: &IPAllocation,
        slot: &mut PoolSlot,
        err: &IpamError,
    ) -> Result<ReconcileOutcome, IpamError> {
        let key = allocation.key();
        if let Some(loaded) = slot.loaded.as_mut() {
            loaded.conflicts.remove(&key);
        }

        let message = format!("Recorded addresses are no longer available ({err}), allocating again");
        let mut status = allocation.status.clone().unwrap_or_default();
        status.phase = IPAllocationPhase::Pending;
        clear_holding(&mut status);
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                reasons::RANGE_CONFLICT,
                message.clone(),
                allocation.metadata.generation,
            ),
        );
        self.store.update_allocation_status(allocation, &status).await?;
        self.publish_logged(slot).await;

        warn!(allocation = %key, error = %err, "Recorded holding collides, reset to Pending");
        Ok(ReconcileOutcome::Waiting {
            reason: reasons::RANGE_CONFLICT.to_string(),
            message,
        })
    }

    /// Grow or shrink an elastic load-balancer holding
    async fn resize(
        &self,
        allocation: &IPAllocation,
        slot: &mut PoolSlot,
        held: &[AddressRange],
    ) -> Result<ReconcileOutcome, IpamError> {
        let Some(tracker) = self.bindings.as_ref() else {
            return Ok(ReconcileOutcome::AlreadyAllocated);
        };
        let provider = match self.provider_config(allocation).await {
            Ok(provider) => provider,
            Err(IpamError::PoolNotFound(what)) => {
                debug!(allocation = %allocation.key(), %what, "Provider config missing, holding fixed");
                return Ok(ReconcileOutcome::AlreadyAllocated);
            }
            Err(e) => return Err(e),
        };
        let Some(sizer) = ElasticSizer::from_config(
            provider
                .as_ref()
                .and_then(|p| p.spec.network.as_ref())
                .and_then(|n| n.load_balancer.as_ref()),
        ) else {
            return Ok(ReconcileOutcome::AlreadyAllocated);
        };
        let Some(bound) = tracker.bound_addresses(allocation).await? else {
            return Ok(ReconcileOutcome::AlreadyAllocated);
        };

        let key = allocation.key();
        let (added, removed) = match sizer.plan(held, &bound) {
            ResizePlan::Hold => return Ok(ReconcileOutcome::AlreadyAllocated),
            ResizePlan::Grow(count) => {
                let Some(loaded) = slot.loaded.as_mut() else {
                    return Ok(ReconcileOutcome::AlreadyAllocated);
                };
                match ElasticSizer::grow(&mut loaded.allocator, held, count) {
                    Ok(range) => (vec![range], Vec::new()),
                    Err(e) if e.is_transient() => {
                        self.record_capacity(allocation, ConditionStatus::False, e.reason(), &e.to_string())
                            .await?;
                        warn!(allocation = %key, error = %e, "Elastic pool cannot grow");
                        return Ok(ReconcileOutcome::AlreadyAllocated);
                    }
                    Err(e) => return Err(e),
                }
            }
            ResizePlan::Shrink(ranges) => (Vec::new(), ranges),
        };

        let holding = apply_resize(held, &added, &removed);
        let added_count = crate::address::total_len(&added);
        let removed_count = crate::address::total_len(&removed);

        let mut status = allocation.status.clone().unwrap_or_default();
        record_holding(&mut status, &holding);
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_CAPACITY,
                ConditionStatus::True,
                reasons::CAPACITY_SUFFICIENT,
                format!("Holding {} load-balancer addresses", status.allocated_count),
                allocation.metadata.generation,
            ),
        );

        let release_added = |slot: &mut PoolSlot| {
            if let Some(loaded) = slot.loaded.as_mut() {
                for range in &added {
                    loaded.allocator.release(*range);
                }
            }
        };
        let updated = match self.store.update_allocation_status(allocation, &status).await {
            Ok(updated) => updated,
            Err(e) => {
                release_added(slot);
                return Err(e.into());
            }
        };

        if let Some(loaded) = slot.loaded.as_mut() {
            for range in &removed {
                loaded.allocator.release(*range);
            }
            loaded.owners.insert(key.clone(), holding);
        }
        if added.is_empty() {
            self.publish_logged(slot).await;
        } else if let Err(e) = self.claim(slot).await {
            release_added(slot);
            if let Some(loaded) = slot.loaded.as_mut() {
                loaded.owners.insert(key.clone(), held.to_vec());
            }
            self.withdraw(&updated, &allocation.status.clone().unwrap_or_default()).await;
            warn!(allocation = %key, error = %e, "Lost the pool write, growth withdrawn");
            return Err(e.into());
        }

        info!(allocation = %key, added = added_count, removed = removed_count, "Resized elastic holding");
        Ok(ReconcileOutcome::Resized {
            added: added_count,
            removed: removed_count,
        })
    }

    async fn record_capacity(
        &self,
        allocation: &IPAllocation,
        condition_status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Result<(), IpamError> {
        let mut status = allocation.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_CAPACITY,
                condition_status,
                reason,
                message,
                allocation.metadata.generation,
            ),
        );
        if allocation.status.as_ref() != Some(&status) {
            self.store.update_allocation_status(allocation, &status).await?;
        }
        Ok(())
    }

    /// `Allocated -> Released`
    ///
    /// Frees only ranges this allocation owns in the registry, so a
    /// collision loser never frees addresses held by someone else. Safe to
    /// call repeatedly.
    pub async fn release(&self, allocation: &IPAllocation) -> Result<ReconcileOutcome, IpamError> {
        let namespace = namespace_of(allocation);
        let key = allocation.key();
        let mut freed = 0;

        if has_holding(allocation) {
            let pool_name = allocation
                .status
                .as_ref()
                .and_then(|s| s.allocated_by.clone())
                .unwrap_or_else(|| allocation.spec.pool_ref.name.clone());
            let mut guard = self.registry.lock_one(&object_key(namespace, &pool_name)).await;
            let slot: &mut PoolSlot = &mut guard;
            match self.load(slot, namespace, &pool_name).await {
                Ok(()) => {
                    if let Some(loaded) = slot.loaded.as_mut() {
                        freed = loaded.release_owner(&key);
                    }
                    if freed > 0 {
                        self.publish_logged(slot).await;
                    }
                }
                Err(IpamError::PoolNotFound(what)) => {
                    debug!(allocation = %key, %what, "Pool is gone, nothing to free");
                }
                Err(IpamError::InvalidPool(why)) => {
                    debug!(allocation = %key, %why, "Pool configuration is invalid, nothing to free");
                }
                Err(e) => return Err(e),
            }
        }

        if !allocation.phase().is_terminal() || has_holding(allocation) {
            let mut status = allocation.status.clone().unwrap_or_default();
            status.phase = IPAllocationPhase::Released;
            status.addresses.clear();
            status.allocated_count = 0;
            status.released_at = Some(Utc::now());
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    reasons::RELEASED,
                    format!("Released {freed} addresses"),
                    allocation.metadata.generation,
                ),
            );
            match self.store.update_allocation_status(allocation, &status).await {
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(allocation = %key, freed, "Released addresses");
        Ok(ReconcileOutcome::Released { freed })
    }

    /// Bring a pool's slot and status up to date.
    ///
    /// The slot is rebuilt from persisted allocations only if the stored pool
    /// changed since this controller last wrote it, so the watch event for
    /// our own status write is cheap.
    pub async fn refresh_pool(&self, namespace: &str, name: &str) -> Result<PoolRefresh, IpamError> {
        let key = object_key(namespace, name);
        let mut guard = self.registry.lock_one(&key).await;
        let slot: &mut PoolSlot = &mut guard;

        match self.load(slot, namespace, name).await {
            Ok(()) => {}
            Err(IpamError::PoolNotFound(_)) => {
                drop(guard);
                self.registry.forget(&key);
                debug!(pool = %key, "Pool deleted, slot dropped");
                return Ok(PoolRefresh::Missing);
            }
            Err(IpamError::InvalidPool(why)) => {
                self.record_invalid_pool(namespace, name, &why).await?;
                return Ok(PoolRefresh::Invalid(why));
            }
            Err(e) => return Err(e),
        }

        self.publish(slot).await?;
        let conflicts = slot.loaded.as_ref().map_or(0, |l| l.conflicts.len());
        let status = slot.loaded.as_ref().and_then(|l| l.pool.status.clone()).unwrap_or_default();
        info!(
            pool = %key,
            total = status.total_ips,
            allocated = status.allocated_ips,
            fragmentation = status.fragmentation_percent.unwrap_or_default(),
            conflicts,
            "Pool refreshed"
        );
        Ok(PoolRefresh::Ready { status, conflicts })
    }

    async fn record_invalid_pool(&self, namespace: &str, name: &str, why: &str) -> Result<(), IpamError> {
        let Some(pool) = self.store.get_pool(namespace, name).await? else {
            return Ok(());
        };
        let mut status = pool.status.clone().unwrap_or_default();
        status.observed_generation = pool.metadata.generation;
        set_condition(
            &mut status.conditions,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                reasons::INVALID_CONFIGURATION,
                why,
                pool.metadata.generation,
            ),
        );
        if pool.status.as_ref() != Some(&status) {
            self.store.update_pool_status(&pool, &status).await?;
        }
        error!(pool = %object_key(namespace, name), %why, "Pool configuration rejected");
        Ok(())
    }
}

/// Result of refreshing a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolRefresh {
    /// Pool loaded and status current
    Ready {
        /// Status now stored on the pool
        status: crds::NetworkPoolStatus,
        /// Allocations whose recorded ranges collide
        conflicts: usize,
    },
    /// Pool configuration was rejected
    Invalid(String),
    /// Pool no longer exists
    Missing,
}
