//! Free-list tracking for a single pool
//!
//! Free space is kept as a sorted map of disjoint, non-adjacent blocks
//! (`start -> end`) plus a secondary index ordered by `(size, start)` so
//! best-fit lookups are a single range query.

use crate::address::AddressRange;
use crate::error::IpamError;
use std::collections::{BTreeMap, BTreeSet};

/// Free-space statistics for one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeListMetrics {
    /// Addresses currently free
    pub total_free: u64,
    /// Size of the largest contiguous free block
    pub largest_free_block: u64,
    /// `floor(100 * (total_free - largest) / total_free)`, 0 when nothing is free
    pub fragmentation_percent: u32,
    /// Number of disjoint free blocks
    pub free_blocks: usize,
}

/// Sorted, coalesced set of free address blocks
#[derive(Debug, Clone, Default)]
pub struct FreeListTracker {
    blocks: BTreeMap<u32, u32>,
    by_size: BTreeSet<(u64, u32)>,
    total_free: u64,
}

impl FreeListTracker {
    /// Tracker with no free space
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker seeded with the given ranges as free
    pub fn with_free<I>(ranges: I) -> Self
    where
        I: IntoIterator<Item = AddressRange>,
    {
        let mut tracker = Self::new();
        for range in ranges {
            tracker.release(range);
        }
        tracker
    }

    /// Smallest free block holding `count` addresses, lowest start on ties.
    ///
    /// Returns the first `count` addresses of that block without reserving
    /// them.
    pub fn find_fit(&self, count: u64) -> Result<AddressRange, IpamError> {
        if count == 0 {
            return Err(IpamError::InvalidRequest("count must be at least 1".to_string()));
        }
        self.by_size
            .range((count, 0)..)
            .next()
            .and_then(|&(_, start)| self.block_at(start))
            .and_then(|block| block.take_first(count))
            .ok_or(IpamError::InsufficientSpace {
                requested: count,
                largest: self.largest_free_block(),
            })
    }

    /// Remove `range` from the free list; every address in it must be free
    pub fn reserve(&mut self, range: AddressRange) -> Result<(), IpamError> {
        let block = self
            .containing_block(range.start())
            .filter(|block| block.contains(&range))
            .ok_or(IpamError::RangeConflict(range))?;

        self.remove_block(block);
        let (below, above) = block.subtract(&range);
        if let Some(below) = below {
            self.insert_block(below);
        }
        if let Some(above) = above {
            self.insert_block(above);
        }
        Ok(())
    }

    /// Return `range` to the free list, merging with neighbours.
    ///
    /// Addresses that are already free are left alone; the return value is
    /// the number of addresses that actually changed state.
    pub fn release(&mut self, range: AddressRange) -> u64 {
        let scan_from = range.start().saturating_sub(1);
        let scan_to = range.end().saturating_add(1);

        let mut merged = range;
        let mut already_free = 0;
        let mut absorbed = Vec::new();

        if let Some(block) = self.containing_block(scan_from) {
            absorbed.push(block);
        }
        let neighbours = self
            .blocks
            .range(scan_from..=scan_to)
            .filter_map(|(&start, &end)| AddressRange::new(start, end).ok());
        for block in neighbours {
            if absorbed.last() != Some(&block) {
                absorbed.push(block);
            }
        }

        for block in absorbed {
            if let Some(union) = merged.merge(&block) {
                already_free += block.intersect(&range).map_or(0, |common| common.len());
                merged = union;
                self.remove_block(block);
            }
        }

        self.insert_block(merged);
        range.len() - already_free
    }

    /// Whether every address of `range` is free
    pub fn is_free(&self, range: &AddressRange) -> bool {
        self.containing_block(range.start())
            .is_some_and(|block| block.contains(range))
    }

    /// Free blocks in address order
    pub fn blocks(&self) -> impl Iterator<Item = AddressRange> + '_ {
        self.blocks
            .iter()
            .filter_map(|(&start, &end)| AddressRange::new(start, end).ok())
    }

    /// Addresses currently free
    pub fn total_free(&self) -> u64 {
        self.total_free
    }

    /// Size of the largest free block (0 when nothing is free)
    pub fn largest_free_block(&self) -> u64 {
        self.by_size.last().map_or(0, |&(len, _)| len)
    }

    /// Free-space statistics
    pub fn metrics(&self) -> FreeListMetrics {
        let largest = self.largest_free_block();
        let fragmentation_percent = if self.total_free == 0 {
            0
        } else {
            // (total - largest) * 100 < total * 100 <= 100 * 2^32, fits u64
            ((self.total_free - largest) * 100 / self.total_free) as u32
        };
        FreeListMetrics {
            total_free: self.total_free,
            largest_free_block: largest,
            fragmentation_percent,
            free_blocks: self.blocks.len(),
        }
    }

    fn block_at(&self, start: u32) -> Option<AddressRange> {
        self.blocks
            .get(&start)
            .and_then(|&end| AddressRange::new(start, end).ok())
    }

    fn containing_block(&self, address: u32) -> Option<AddressRange> {
        self.blocks
            .range(..=address)
            .next_back()
            .filter(|&(_, &end)| end >= address)
            .and_then(|(&start, &end)| AddressRange::new(start, end).ok())
    }

    fn insert_block(&mut self, block: AddressRange) {
        self.blocks.insert(block.start(), block.end());
        self.by_size.insert((block.len(), block.start()));
        self.total_free += block.len();
    }

    fn remove_block(&mut self, block: AddressRange) {
        if self.blocks.remove(&block.start()).is_some() {
            self.by_size.remove(&(block.len(), block.start()));
            self.total_free -= block.len();
        }
    }
}
