//! Health and metrics HTTP endpoints.

use crate::error::ControllerError;
use crate::metrics::IpamMetrics;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// State shared with the HTTP handlers
#[derive(Debug, Clone)]
pub struct HealthState {
    metrics: Arc<IpamMetrics>,
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create state; not ready until [`HealthState::set_ready`] is called
    pub fn new(metrics: Arc<IpamMetrics>) -> Self {
        Self {
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the controller ready (watchers started)
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

/// Routes: `/healthz`, `/readyz` and `/metrics`
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn readyz(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn metrics(State(state): State<HealthState>) -> Result<String, (StatusCode, String)> {
    state
        .metrics
        .encode()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Serve the health routes until the listener fails
pub async fn serve(addr: SocketAddr, state: HealthState) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("cannot bind health address {addr}: {e}")))?;
    info!(%addr, "Serving health and metrics");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ControllerError::Watch(format!("health server failed: {e}")))
}
