//! Main controller implementation.
//!
//! Wires the Kubernetes-backed store into the allocation lifecycle, starts
//! one watcher per resource kind plus the health server, and exits as soon
//! as any of them stops.

use crate::bindings::AnnotationBindingTracker;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::kube_store::KubeIpamStore;
use crate::metrics::IpamMetrics;
use crate::reconciler::Reconciler;
use crate::server::{self, HealthState};
use crate::watcher::Watcher;
use crds::{IPAllocation, NetworkPool};
use ipam::LifecycleController;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Main controller for address allocation.
#[derive(Debug)]
pub struct Controller {
    ip_allocation_watcher: JoinHandle<Result<(), ControllerError>>,
    network_pool_watcher: JoinHandle<Result<(), ControllerError>>,
    health_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing IPAM Controller");

        let kube_client = Client::try_default().await?;

        let ip_allocation_api: Api<IPAllocation> = match config.namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client.clone(), ns),
            None => Api::all(kube_client.clone()),
        };
        let network_pool_api: Api<NetworkPool> = match config.namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client.clone(), ns),
            None => Api::all(kube_client.clone()),
        };

        let metrics = Arc::new(IpamMetrics::new()?);
        let lifecycle = LifecycleController::new(Arc::new(KubeIpamStore::new(kube_client.clone())))
            .with_binding_tracker(Arc::new(AnnotationBindingTracker));
        let reconciler = Arc::new(Reconciler::new(
            kube_client,
            Arc::new(lifecycle),
            Arc::clone(&metrics),
            &config,
        ));

        let health = HealthState::new(metrics);
        let health_server = {
            let health = health.clone();
            let addr = config.health_addr;
            tokio::spawn(async move { server::serve(addr, health).await })
        };

        let watcher_instance = Arc::new(Watcher::new(
            reconciler,
            config.concurrency,
            ip_allocation_api,
            network_pool_api,
        ));

        // Pools first, so the first allocations find a warm slot
        let network_pool_watcher = {
            let watcher = Arc::clone(&watcher_instance);
            tokio::spawn(async move { watcher.watch_network_pools().await })
        };

        let ip_allocation_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.watch_ip_allocations().await })
        };

        health.set_ready();

        Ok(Self {
            ip_allocation_watcher,
            network_pool_watcher,
            health_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("IPAM Controller running");

        tokio::select! {
            result = &mut self.ip_allocation_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("IPAllocation watcher panicked: {e}")))??;
            }
            result = &mut self.network_pool_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("NetworkPool watcher panicked: {e}")))??;
            }
            result = &mut self.health_server => {
                result.map_err(|e| ControllerError::Watch(format!("Health server panicked: {e}")))??;
            }
        }

        Ok(())
    }
}
