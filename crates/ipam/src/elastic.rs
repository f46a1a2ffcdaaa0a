//! Elastic load-balancer sizing
//!
//! In elastic mode a load-balancer allocation starts at `initialPoolSize`,
//! grows by `growthIncrement` whenever every held address is bound to a
//! service, and gives back unbound addresses above the floor. Static mode has
//! no sizer at all.

use crate::address::{self, AddressRange};
use crate::error::IpamError;
use crate::pool::PoolAllocator;
use crds::{LoadBalancerAllocationMode, ProviderLoadBalancerConfig};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::debug;

/// What an elastic allocation should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizePlan {
    /// Holding matches demand
    Hold,
    /// Reserve this many more addresses
    Grow(u64),
    /// Give back these ranges
    Shrink(Vec<AddressRange>),
}

/// Grow/shrink policy for one provider's load-balancer config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElasticSizer {
    initial: u64,
    increment: u64,
}

impl ElasticSizer {
    /// Sizer for an elastic config, `None` in static mode
    pub fn from_config(config: Option<&ProviderLoadBalancerConfig>) -> Option<Self> {
        let config = config?;
        (config.allocation_mode == LoadBalancerAllocationMode::Elastic).then(|| Self {
            initial: u64::from(config.initial_pool_size()),
            increment: u64::from(config.growth_increment()),
        })
    }

    /// Starting size and shrink floor
    pub fn initial_pool_size(&self) -> u64 {
        self.initial
    }

    /// Addresses added per growth step
    pub fn growth_increment(&self) -> u64 {
        self.increment
    }

    /// Decide the next step from the held ranges and the bound addresses.
    ///
    /// Shrinking never takes the holding below `initialPoolSize` or below the
    /// number of bound addresses, and gives back the highest unbound
    /// addresses first.
    pub fn plan(&self, held: &[AddressRange], bound: &BTreeSet<Ipv4Addr>) -> ResizePlan {
        let held_count = address::total_len(held);
        let in_use_count = bound
            .iter()
            .filter(|ip| held.iter().any(|range| range.contains_addr(u32::from(**ip))))
            .count() as u64;

        if held_count > 0 && in_use_count == held_count {
            return if self.increment == 0 {
                ResizePlan::Hold
            } else {
                ResizePlan::Grow(self.increment)
            };
        }

        let floor = self.initial.max(in_use_count);
        if held_count <= floor {
            return ResizePlan::Hold;
        }

        let excess = usize::try_from(held_count - floor).unwrap_or(usize::MAX);
        let mut unbound: Vec<Ipv4Addr> = held
            .iter()
            .flat_map(AddressRange::addresses)
            .filter(|ip| !bound.contains(ip))
            .collect();
        unbound.sort_unstable_by(|a, b| b.cmp(a));
        unbound.truncate(excess);

        if unbound.is_empty() {
            ResizePlan::Hold
        } else {
            ResizePlan::Shrink(address::coalesce(unbound))
        }
    }

    /// Reserve `count` more addresses for an allocation holding `held`.
    ///
    /// Extending the last held block is preferred so the holding stays
    /// contiguous; otherwise the pool's best fit is used.
    pub fn grow(pool: &mut PoolAllocator, held: &[AddressRange], count: u64) -> Result<AddressRange, IpamError> {
        let extension = held
            .iter()
            .max()
            .and_then(|last| last.end().checked_add(1))
            .and_then(|start| {
                let end = u64::from(start) + count - 1;
                u32::try_from(end).ok().and_then(|end| AddressRange::new(start, end).ok())
            });

        if let Some(extension) = extension
            && pool.contains(&extension)
            && pool.is_free(&extension)
        {
            debug!(pool = pool.name(), range = %extension, "Extending elastic holding in place");
            return pool.allocate_pinned(extension);
        }

        pool.allocate(count).map_err(|e| match e {
            IpamError::InsufficientSpace { requested, .. } => IpamError::PoolExhausted {
                pools: vec![pool.name().to_string()],
                requested,
            },
            other => other,
        })
    }

    /// Return shrink ranges to the pool, reporting how many addresses were freed
    pub fn shrink(pool: &mut PoolAllocator, ranges: &[AddressRange]) -> u64 {
        ranges.iter().map(|range| pool.release(*range)).sum()
    }
}

/// Held ranges after adding `added` and removing `removed`, normalized
pub fn apply_resize(held: &[AddressRange], added: &[AddressRange], removed: &[AddressRange]) -> Vec<AddressRange> {
    let mut remaining: Vec<AddressRange> = held.iter().chain(added).copied().collect();
    for hole in removed {
        remaining = remaining
            .into_iter()
            .flat_map(|piece| {
                let (below, above) = piece.subtract(hole);
                below.into_iter().chain(above)
            })
            .collect();
    }
    address::normalize(remaining)
}
