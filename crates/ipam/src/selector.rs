//! Priority-ordered pool selection
//!
//! Count requests fan out across candidate pools in priority order (lower
//! first, list order on ties) and stop at the first pool with room. Pinned
//! requests go to the one pool whose CIDR contains the range.

use crate::address::AddressRange;
use crate::error::IpamError;
use crate::pool::PoolAllocator;
use tracing::debug;

/// Shape of an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRequest {
    /// Any contiguous block of this many addresses
    Count(u64),
    /// Exactly this range
    Pinned(AddressRange),
}

/// A pool offered to the selector
#[derive(Debug)]
pub struct PoolCandidate<'a> {
    /// Lower values are tried first
    pub priority: i32,
    /// The pool's allocator, already locked by the caller
    pub pool: &'a mut PoolAllocator,
}

/// Result of a successful selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Name of the pool that satisfied the request
    pub pool: String,
    /// Range reserved in that pool
    pub range: AddressRange,
}

/// Deterministic selector over an ordered candidate list
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityPoolSelector;

impl PriorityPoolSelector {
    /// Reserve addresses for `request` in the first suitable candidate.
    ///
    /// Candidates are stably sorted by priority in place.
    pub fn select(
        candidates: &mut [PoolCandidate<'_>],
        request: AllocationRequest,
    ) -> Result<Selection, IpamError> {
        if candidates.is_empty() {
            return Err(IpamError::InvalidRequest("no candidate pools".to_string()));
        }
        candidates.sort_by_key(|candidate| candidate.priority);

        match request {
            AllocationRequest::Count(count) => Self::select_count(candidates, count),
            AllocationRequest::Pinned(range) => Self::select_pinned(candidates, range),
        }
    }

    fn select_count(candidates: &mut [PoolCandidate<'_>], count: u64) -> Result<Selection, IpamError> {
        let mut attempted = Vec::with_capacity(candidates.len());
        for candidate in candidates.iter_mut() {
            let name = candidate.pool.name().to_string();
            match candidate.pool.allocate(count) {
                Ok(range) => {
                    debug!(pool = %name, %range, skipped = ?attempted, "Pool selected");
                    return Ok(Selection { pool: name, range });
                }
                Err(IpamError::InsufficientSpace { largest, .. }) => {
                    debug!(pool = %name, requested = count, largest, "Pool cannot fit request, trying next");
                    attempted.push(name);
                }
                Err(e) => return Err(e),
            }
        }
        Err(IpamError::PoolExhausted {
            pools: attempted,
            requested: count,
        })
    }

    fn select_pinned(candidates: &mut [PoolCandidate<'_>], range: AddressRange) -> Result<Selection, IpamError> {
        let names: Vec<String> = candidates.iter().map(|c| c.pool.name().to_string()).collect();
        let candidate = candidates
            .iter_mut()
            .find(|candidate| candidate.pool.cidr().contains(&range))
            .ok_or_else(|| IpamError::OutOfRange {
                range,
                pools: names.join(", "),
            })?;

        let range = candidate.pool.allocate_pinned(range)?;
        Ok(Selection {
            pool: candidate.pool.name().to_string(),
            range,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::NetworkPoolSpec;

    fn pool(name: &str, cidr: &str) -> PoolAllocator {
        PoolAllocator::from_spec(
            name,
            &NetworkPoolSpec {
                cidr: cidr.to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_falls_back_to_next_priority() {
        let mut a = pool("a", "10.0.0.0/30");
        let mut b = pool("b", "10.0.1.0/24");
        a.allocate(4).unwrap();

        let mut candidates = vec![
            PoolCandidate { priority: 1, pool: &mut b },
            PoolCandidate { priority: 0, pool: &mut a },
        ];
        let selection = PriorityPoolSelector::select(&mut candidates, AllocationRequest::Count(3)).unwrap();
        assert_eq!(selection.pool, "b");
        assert_eq!(selection.range.len(), 3);
    }

    #[test]
    fn test_equal_priority_keeps_list_order() {
        let mut first = pool("first", "10.0.0.0/24");
        let mut second = pool("second", "10.0.1.0/24");
        let mut candidates = vec![
            PoolCandidate { priority: 0, pool: &mut first },
            PoolCandidate { priority: 0, pool: &mut second },
        ];
        let selection = PriorityPoolSelector::select(&mut candidates, AllocationRequest::Count(1)).unwrap();
        assert_eq!(selection.pool, "first");
    }

    #[test]
    fn test_exhaustion_names_every_attempted_pool() {
        let mut a = pool("a", "10.0.0.0/30");
        let mut b = pool("b", "10.0.1.0/30");
        let mut candidates = vec![
            PoolCandidate { priority: 0, pool: &mut a },
            PoolCandidate { priority: 1, pool: &mut b },
        ];
        let err = PriorityPoolSelector::select(&mut candidates, AllocationRequest::Count(8)).unwrap_err();
        assert_eq!(
            err,
            IpamError::PoolExhausted {
                pools: vec!["a".into(), "b".into()],
                requested: 8,
            }
        );
    }

    #[test]
    fn test_pinned_does_not_fan_out() {
        let mut a = pool("a", "10.0.0.0/24");
        let mut b = pool("b", "10.0.1.0/24");
        let wanted = AddressRange::parse_range("10.0.1.5", "10.0.1.10").unwrap();
        a.allocate(1).unwrap();

        let mut candidates = vec![
            PoolCandidate { priority: 0, pool: &mut a },
            PoolCandidate { priority: 1, pool: &mut b },
        ];
        let selection = PriorityPoolSelector::select(&mut candidates, AllocationRequest::Pinned(wanted)).unwrap();
        assert_eq!(selection, Selection { pool: "b".into(), range: wanted });

        // Second attempt conflicts in b and is not retried elsewhere
        let err = PriorityPoolSelector::select(&mut candidates, AllocationRequest::Pinned(wanted)).unwrap_err();
        assert_eq!(err, IpamError::RangeConflict(wanted));

        let outside = AddressRange::parse_range("192.168.0.1", "192.168.0.2").unwrap();
        let err = PriorityPoolSelector::select(&mut candidates, AllocationRequest::Pinned(outside)).unwrap_err();
        assert!(matches!(err, IpamError::OutOfRange { pools, .. } if pools == "a, b"));
    }
}
