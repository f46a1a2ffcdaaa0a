//! Kubernetes resource watchers.
//!
//! Both watchers go through `watch_resource()`, which runs a
//! kube_runtime::Controller with reconnection, debounce and a concurrency
//! limit, and requeues failed reconciles with the per-resource backoff.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{IPAllocation, NetworkPool};
use futures::StreamExt;
use futures::future::BoxFuture;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay after the last event before a reconcile starts
const DEBOUNCE: Duration = Duration::from_secs(1);

/// Run a controller for `K` until the watch stream ends
async fn watch_resource<K, F>(
    api: Api<K>,
    reconciler: Arc<Reconciler>,
    concurrency: u16,
    reconcile_fn: F,
    resource_name: &'static str,
) -> Result<(), ControllerError>
where
    K: kube::Resource + Clone + Send + Sync + 'static + std::fmt::Debug + serde::de::DeserializeOwned,
    K::DynamicType: Default + std::cmp::Eq + std::hash::Hash + Clone + std::fmt::Debug + Unpin,
    F: Fn(Arc<Reconciler>, Arc<K>) -> BoxFuture<'static, Result<Action, ControllerError>> + Send + Sync + Clone + 'static,
{
    info!(resource = resource_name, concurrency, "Starting watcher");

    let error_policy = move |obj: Arc<K>, error: &ControllerError, ctx: Arc<Reconciler>| {
        let key = format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any());
        let (delay, attempts) = ctx.policy.backoff(&key);
        warn!(
            resource = resource_name,
            object = %key,
            %error,
            attempts,
            retry_in = delay.as_secs(),
            "Reconcile failed, backing off"
        );
        Action::requeue(delay)
    };

    let reconcile = move |obj: Arc<K>, ctx: Arc<Reconciler>| {
        debug!(resource = resource_name, object = %obj.name_any(), "Reconciling");
        reconcile_fn(ctx, obj)
    };

    let controller_config = ControllerConfig::default().debounce(DEBOUNCE).concurrency(concurrency);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                debug!(resource = resource_name, error = %e, "Controller stream error");
            }
        })
        .await;

    info!(resource = resource_name, "Watcher stopped");
    Ok(())
}

/// Watches IPAllocations and NetworkPools.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    concurrency: u16,
    ip_allocation_api: Api<IPAllocation>,
    network_pool_api: Api<NetworkPool>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        concurrency: u16,
        ip_allocation_api: Api<IPAllocation>,
        network_pool_api: Api<NetworkPool>,
    ) -> Self {
        Self {
            reconciler,
            concurrency,
            ip_allocation_api,
            network_pool_api,
        }
    }

    /// Watch IPAllocation resources
    pub async fn watch_ip_allocations(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.ip_allocation_api.clone(),
            Arc::clone(&self.reconciler),
            self.concurrency,
            |ctx, obj| Box::pin(async move { ctx.reconcile_ip_allocation(obj).await }),
            "IPAllocation",
        )
        .await
    }

    /// Watch NetworkPool resources
    pub async fn watch_network_pools(&self) -> Result<(), ControllerError> {
        watch_resource(
            self.network_pool_api.clone(),
            Arc::clone(&self.reconciler),
            self.concurrency,
            |ctx, obj| Box::pin(async move { ctx.reconcile_network_pool(obj).await }),
            "NetworkPool",
        )
        .await
    }
}
