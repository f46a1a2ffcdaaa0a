//! NetworkPool reconciliation.
//!
//! Publishes the pool's status and exports usage gauges. The cached
//! allocator is rebuilt from persisted allocations only when another writer
//! or a spec edit changed the pool since this controller last wrote it.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::NetworkPool;
use ipam::PoolRefresh;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const KIND: &str = "NetworkPool";

impl Reconciler {
    /// Reconcile one NetworkPool
    pub async fn reconcile_network_pool(&self, pool: Arc<NetworkPool>) -> Result<Action, ControllerError> {
        let namespace = pool.namespace().unwrap_or_else(|| "default".to_string());
        let name = pool.name_any();
        let key = format!("{namespace}/{name}");

        let refresh = match self.lifecycle.refresh_pool(&namespace, &name).await {
            Ok(refresh) => refresh,
            Err(e) => {
                self.metrics.record_error(KIND);
                error!(pool = %key, error = %e, "NetworkPool refresh failed");
                return Err(e.into());
            }
        };

        match refresh {
            PoolRefresh::Ready { status, conflicts } => {
                self.metrics.record_reconcile(KIND, "ready");
                self.metrics.observe_pool(&namespace, &name, &status);
                if conflicts > 0 {
                    warn!(pool = %key, conflicts, "Allocations with colliding ranges were left unowned");
                } else {
                    debug!(
                        pool = %key,
                        allocated = status.allocated_ips,
                        available = status.available_ips,
                        "Pool status current"
                    );
                }
                self.policy.reset(&key);
                Ok(Action::requeue(self.policy.resync()))
            }
            PoolRefresh::Invalid(why) => {
                self.metrics.record_reconcile(KIND, "invalid");
                debug!(pool = %key, reason = %why, "Waiting for a corrected NetworkPool spec");
                Ok(Action::requeue(self.policy.resync()))
            }
            PoolRefresh::Missing => {
                self.metrics.record_reconcile(KIND, "missing");
                self.metrics.forget_pool(&namespace, &name);
                self.policy.forget(&key);
                info!(pool = %key, "NetworkPool gone, slot dropped");
                Ok(Action::await_change())
            }
        }
    }
}
