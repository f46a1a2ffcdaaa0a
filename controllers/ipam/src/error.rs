//! Controller-specific error types.
//!
//! Allocation failures that the lifecycle already recorded on the object are
//! not errors here; only failures that should drive a backoff requeue are.

use ipam::IpamError;
use kube::Error as KubeError;
use kube_runtime::finalizer::Error as FinalizerError;
use thiserror::Error;

/// Errors that can occur in the IPAM controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Allocator error the lifecycle could not record on the object
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Finalizer add/remove or cleanup failed
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<FinalizerError<ControllerError>>),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
