//! Allocator errors
//!
//! The address, free-list and pool layers raise the narrow kinds; the
//! selector folds per-pool exhaustion into [`IpamError::PoolExhausted`]; the
//! lifecycle controller is the only layer that turns an error into a retry
//! decision and a condition reason.

use crate::address::AddressRange;
use crds::reasons;
use thiserror::Error;

/// Errors raised by the persisted store seam
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Version token did not match (compare-and-swap lost)
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Any other backend failure
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors that can occur while allocating or releasing addresses
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpamError {
    /// Malformed dotted-quad or CIDR string
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Range whose start is after its end
    #[error("Range start {start} is after end {end}")]
    RangeOrder {
        /// First address as written
        start: String,
        /// Last address as written
        end: String,
    },

    /// Exact range is not free
    #[error("Range {0} overlaps addresses that are not free")]
    RangeConflict(AddressRange),

    /// Exact range is outside the allocatable space
    #[error("Range {range} is outside the allocatable space of {pools}")]
    OutOfRange {
        /// Requested range
        range: AddressRange,
        /// Pool (or comma-separated pools) that were checked
        pools: String,
    },

    /// No free block large enough in a single pool
    #[error("No free block of {requested} addresses (largest free block is {largest})")]
    InsufficientSpace {
        /// Requested block size
        requested: u64,
        /// Largest free block at the time of the request
        largest: u64,
    },

    /// Every candidate pool was exhausted
    #[error("All candidate pools exhausted for {requested} addresses: {}", pools.join(", "))]
    PoolExhausted {
        /// Pools tried, in attempt order
        pools: Vec<String>,
        /// Requested block size
        requested: u64,
    },

    /// Pool configuration rejected at validation time
    #[error("Invalid pool configuration: {0}")]
    InvalidPool(String),

    /// Request shape is not acceptable
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Tenant quota would be exceeded
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Referenced pool or provider config does not exist
    #[error("Not found: {0}")]
    PoolNotFound(String),

    /// Persisted store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IpamError {
    /// Whether retrying later can succeed without the request changing
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::InsufficientSpace { .. }
                | Self::PoolExhausted { .. }
                | Self::InvalidPool(_)
                | Self::PoolNotFound(_)
                | Self::Store(_)
        )
    }

    /// Condition reason surfaced to the requester
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InsufficientSpace { .. } | Self::PoolExhausted { .. } => reasons::POOL_EXHAUSTED,
            Self::RangeConflict(_) => reasons::RANGE_CONFLICT,
            Self::OutOfRange { .. } => reasons::OUT_OF_RANGE,
            Self::InvalidAddress(_) | Self::RangeOrder { .. } | Self::InvalidRequest(_) => {
                reasons::INVALID_REQUEST
            }
            Self::QuotaExceeded(_) => reasons::QUOTA_EXCEEDED,
            Self::PoolNotFound(_) => reasons::POOL_NOT_FOUND,
            Self::InvalidPool(_) | Self::Store(_) => reasons::ALLOCATION_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_is_transient_and_pinned_failures_are_terminal() {
        let exhausted = IpamError::PoolExhausted {
            pools: vec!["a".into(), "b".into()],
            requested: 4,
        };
        assert!(exhausted.is_transient());
        assert_eq!(exhausted.reason(), reasons::POOL_EXHAUSTED);
        assert!(exhausted.to_string().contains("a, b"));

        let conflict = IpamError::RangeConflict(AddressRange::new(5, 10).unwrap());
        assert!(!conflict.is_transient());
        assert_eq!(conflict.reason(), reasons::RANGE_CONFLICT);

        let malformed = IpamError::InvalidAddress("10.0.0.300".into());
        assert!(!malformed.is_transient());
        assert_eq!(malformed.reason(), reasons::INVALID_REQUEST);
    }

    #[test]
    fn test_store_conflict_is_retried() {
        let err: IpamError = StoreError::Conflict("ipa/tenant-a".into()).into();
        assert!(err.is_transient());
        assert_eq!(err.reason(), reasons::ALLOCATION_FAILED);
    }
}
