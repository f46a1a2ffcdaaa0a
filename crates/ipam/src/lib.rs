//! Butler IPAM allocator
//!
//! Fragmentation-aware, priority-ordered IPv4 address allocation for tenant
//! clusters sharing on-premises address space.
//!
//! # Example
//!
//! ```
//! use crds::NetworkPoolSpec;
//! use ipam::{AllocationRequest, PoolAllocator, PoolCandidate, PriorityPoolSelector};
//!
//! # fn example() -> Result<(), ipam::IpamError> {
//! let spec = NetworkPoolSpec {
//!     cidr: "10.50.0.0/24".to_string(),
//!     ..Default::default()
//! };
//! let mut pool = PoolAllocator::from_spec("dc1", &spec)?;
//! let mut candidates = vec![PoolCandidate { priority: 0, pool: &mut pool }];
//! let selection = PriorityPoolSelector::select(&mut candidates, AllocationRequest::Count(5))?;
//! assert_eq!(selection.range.len(), 5);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! # Layers
//!
//! - **address**: range arithmetic and CIDR parsing
//! - **free_list**: best-fit free-space tracking and fragmentation metrics
//! - **pool**: one NetworkPool's allocatable space
//! - **selector**: priority fallback across pools
//! - **elastic**: load-balancer grow/shrink policy
//! - **registry**: per-pool single-writer slots rebuilt from persisted state
//! - **lifecycle**: the IPAllocation state machine

pub mod address;
pub mod elastic;
pub mod error;
pub mod free_list;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod selector;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

#[cfg(test)]
mod lifecycle_test;

pub use address::AddressRange;
pub use elastic::{ElasticSizer, ResizePlan};
pub use error::{IpamError, StoreError};
pub use free_list::{FreeListMetrics, FreeListTracker};
pub use lifecycle::{LifecycleController, PoolRefresh, ReconcileOutcome};
pub use pool::PoolAllocator;
pub use registry::{LoadedPool, PoolRegistry, PoolSlot};
pub use selector::{AllocationRequest, PoolCandidate, PriorityPoolSelector, Selection};
pub use store::{IpamStore, ServiceBindingTracker};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockBindingTracker, MockIpamStore};
