//! IPAM Controller
//!
//! Allocates tenant cluster node and load-balancer addresses from shared
//! NetworkPools:
//! - IPAllocation: reserves a range, records it in status, releases it on deletion
//! - NetworkPool: publishes usage and fragmentation, reports invalid configuration
//!
//! Allocation state lives entirely in the IPAllocation statuses; the
//! in-memory pool slots are rebuilt from them on start-up.

mod backoff;
mod bindings;
mod config;
mod controller;
mod error;
mod kube_store;
mod metrics;
mod reconciler;
mod server;
mod test_utils;
mod watcher;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Fails only when a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting IPAM Controller");

    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!(
        "  Backoff: {}s to {}s, resync every {}s",
        config.backoff_min_seconds,
        config.backoff_max_seconds,
        config.resync.as_secs()
    );
    info!("  Concurrency: {} per watcher", config.concurrency);
    info!("  Health: {}", config.health_addr);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
