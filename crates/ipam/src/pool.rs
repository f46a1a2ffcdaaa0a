//! Single-pool allocator
//!
//! A [`PoolAllocator`] is seeded from a `NetworkPoolSpec`: the base CIDR,
//! narrowed to the tenant allocation window, minus every reserved range.
//! Everything it hands out comes from that allocatable space.

use crate::address::{self, AddressRange};
use crate::error::IpamError;
use crate::free_list::{FreeListMetrics, FreeListTracker};
use crds::{NetworkPoolSpec, NetworkPoolStatus};
use tracing::debug;

/// Allocates and releases ranges within one NetworkPool
#[derive(Debug, Clone)]
pub struct PoolAllocator {
    name: String,
    cidr: AddressRange,
    window: AddressRange,
    reserved: Vec<AddressRange>,
    allocatable: Vec<AddressRange>,
    total: u64,
    free: FreeListTracker,
}

impl PoolAllocator {
    /// Validate a pool spec and seed its free list.
    ///
    /// Reserved ranges must lie inside the CIDR and must not overlap each
    /// other; the tenant window must lie inside the CIDR. Violations are
    /// reported as [`IpamError::InvalidPool`].
    pub fn from_spec(name: &str, spec: &NetworkPoolSpec) -> Result<Self, IpamError> {
        let invalid = |detail: String| IpamError::InvalidPool(format!("{name}: {detail}"));

        let cidr = AddressRange::parse_cidr(&spec.cidr).map_err(|e| invalid(e.to_string()))?;

        let mut reserved = Vec::with_capacity(spec.reserved.len());
        for entry in &spec.reserved {
            let range = AddressRange::parse_cidr(&entry.cidr).map_err(|e| invalid(e.to_string()))?;
            if !cidr.contains(&range) {
                return Err(invalid(format!("reserved range {} is outside {}", entry.cidr, spec.cidr)));
            }
            reserved.push(range);
        }
        reserved.sort();
        if let Some(pair) = reserved.windows(2).find(|pair| pair[0].overlaps(&pair[1])) {
            return Err(invalid(format!("reserved ranges {} and {} overlap", pair[0], pair[1])));
        }

        let window = match spec.tenant_allocation.as_ref() {
            Some(tenant) => {
                let start = match tenant.start.as_deref() {
                    Some(s) => u32::from(AddressRange::parse_address(s).map_err(|e| invalid(e.to_string()))?),
                    None => cidr.start(),
                };
                let end = match tenant.end.as_deref() {
                    Some(s) => u32::from(AddressRange::parse_address(s).map_err(|e| invalid(e.to_string()))?),
                    None => cidr.end(),
                };
                let window = AddressRange::new(start, end).map_err(|e| invalid(format!("tenant allocation: {e}")))?;
                if !cidr.contains(&window) {
                    return Err(invalid(format!("tenant allocation {window} is outside {}", spec.cidr)));
                }
                window
            }
            None => cidr,
        };

        let allocatable = subtract_all(window, &reserved);
        let total = address::total_len(&allocatable);
        debug!(pool = name, %cidr, %window, total, "Seeded pool allocator");

        Ok(Self {
            name: name.to_string(),
            cidr,
            window,
            reserved,
            free: FreeListTracker::with_free(allocatable.iter().copied()),
            allocatable,
            total,
        })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base CIDR range
    pub fn cidr(&self) -> AddressRange {
        self.cidr
    }

    /// Tenant allocation window (the CIDR when no window is configured)
    pub fn window(&self) -> AddressRange {
        self.window
    }

    /// Reserved ranges, sorted
    pub fn reserved(&self) -> &[AddressRange] {
        &self.reserved
    }

    /// Disjoint blocks that may ever be handed out
    pub fn allocatable(&self) -> &[AddressRange] {
        &self.allocatable
    }

    /// Whether `range` lies entirely inside one allocatable block
    pub fn contains(&self, range: &AddressRange) -> bool {
        self.allocatable.iter().any(|block| block.contains(range))
    }

    /// Best-fit allocation of `count` contiguous addresses
    pub fn allocate(&mut self, count: u64) -> Result<AddressRange, IpamError> {
        let range = self.free.find_fit(count)?;
        self.free.reserve(range)?;
        Ok(range)
    }

    /// Reserve exactly `range`
    pub fn allocate_pinned(&mut self, range: AddressRange) -> Result<AddressRange, IpamError> {
        if !self.contains(&range) {
            return Err(IpamError::OutOfRange {
                range,
                pools: self.name.clone(),
            });
        }
        self.free.reserve(range)?;
        Ok(range)
    }

    /// Return `range` to the free list.
    ///
    /// Parts outside the allocatable space and parts already free are
    /// ignored, so releasing twice is harmless. Returns how many addresses
    /// were freed.
    pub fn release(&mut self, range: AddressRange) -> u64 {
        let mut freed = 0;
        for block in &self.allocatable {
            if let Some(part) = block.intersect(&range) {
                freed += self.free.release(part);
            }
        }
        freed
    }

    /// Whether every address of `range` is currently free
    pub fn is_free(&self, range: &AddressRange) -> bool {
        self.free.is_free(range)
    }

    /// Usable addresses (allocatable space, reserved excluded)
    pub fn total_ips(&self) -> u64 {
        self.total
    }

    /// Addresses currently held by allocations
    pub fn allocated_ips(&self) -> u64 {
        self.total - self.free.total_free()
    }

    /// Free-space statistics
    pub fn metrics(&self) -> FreeListMetrics {
        self.free.metrics()
    }

    /// Observed NetworkPool status fields for the current free-list state.
    ///
    /// Conditions and generation are left for the caller to fill in.
    pub fn recompute_status(&self, allocation_count: u64) -> NetworkPoolStatus {
        let metrics = self.free.metrics();
        NetworkPoolStatus {
            total_ips: self.total,
            allocated_ips: self.total - metrics.total_free,
            available_ips: metrics.total_free,
            allocation_count,
            fragmentation_percent: Some(metrics.fragmentation_percent),
            largest_free_block: metrics.largest_free_block,
            ..Default::default()
        }
    }
}

/// `window` minus every range in `holes` (holes sorted and disjoint)
fn subtract_all(window: AddressRange, holes: &[AddressRange]) -> Vec<AddressRange> {
    let mut remaining = vec![window];
    for hole in holes {
        remaining = remaining
            .into_iter()
            .flat_map(|piece| {
                let (below, above) = piece.subtract(hole);
                below.into_iter().chain(above)
            })
            .collect();
    }
    remaining
}
