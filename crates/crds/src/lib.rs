//! Butler IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions consumed and produced by the
//! Butler IPAM controller.

pub mod conditions;
pub mod ip_allocation;
pub mod network_pool;
pub mod provider_config;
pub mod references;

pub use conditions::*;
pub use ip_allocation::*;
pub use network_pool::*;
pub use provider_config::*;
pub use references::*;
