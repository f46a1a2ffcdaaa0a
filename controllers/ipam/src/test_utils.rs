//! Test utilities for unit testing reconcilers
//!
//! Reconcilers are built over the in-memory store; the Kubernetes client
//! points at an unreachable address and is only used by the finalizer path.

#[cfg(test)]
use crate::config::ControllerConfig;
#[cfg(test)]
use crate::metrics::IpamMetrics;
#[cfg(test)]
use crate::reconciler::Reconciler;
#[cfg(test)]
use crds::*;
#[cfg(test)]
use ipam::mock::{test_allocation, test_pool};
#[cfg(test)]
use ipam::{LifecycleController, MockIpamStore};
#[cfg(test)]
use std::sync::Arc;

/// Helper to create a node allocation against pool `dc1`
#[cfg(test)]
pub fn create_test_allocation(name: &str, namespace: &str) -> IPAllocation {
    test_allocation(
        namespace,
        name,
        IPAllocationSpec {
            pool_ref: LocalObjectReference::new("dc1"),
            tenant_cluster_ref: NamespacedObjectReference::with_namespace("tenant-a", namespace),
            allocation_type: IPAllocationType::Nodes,
            count: None,
            pinned_range: None,
            provider_config_ref: None,
        },
    )
}

/// Helper to create a pool over `cidr` with no reserved ranges
#[cfg(test)]
pub fn create_test_pool(name: &str, namespace: &str, cidr: &str) -> NetworkPool {
    test_pool(
        namespace,
        name,
        NetworkPoolSpec {
            cidr: cidr.to_string(),
            ..Default::default()
        },
    )
}

/// Helper to create a reconciler over `store` with default settings
#[cfg(test)]
pub fn create_test_reconciler(store: MockIpamStore) -> Reconciler {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let kube_config = kube::Config::new("http://127.0.0.1:6443".parse().unwrap());
    let client = kube::Client::try_from(kube_config).unwrap();
    let config = ControllerConfig::from_lookup(|_| None).unwrap();
    Reconciler::new(
        client,
        Arc::new(LifecycleController::new(Arc::new(store))),
        Arc::new(IpamMetrics::new().unwrap()),
        &config,
    )
}
