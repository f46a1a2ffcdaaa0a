//! Start-up configuration from environment variables.

use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BACKOFF_MIN_SECONDS: u64 = 15;
const DEFAULT_BACKOFF_MAX_SECONDS: u64 = 600;
const DEFAULT_RESYNC_SECONDS: u64 = 300;
const DEFAULT_CONCURRENCY: u16 = 4;
const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Controller settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace to watch, all namespaces when `None`
    pub namespace: Option<String>,
    /// First backoff delay for transient failures
    pub backoff_min_seconds: u64,
    /// Backoff cap
    pub backoff_max_seconds: u64,
    /// Requeue interval for settled objects
    pub resync: Duration,
    /// Concurrent reconciles per watcher
    pub concurrency: u16,
    /// Listen address for `/healthz`, `/readyz` and `/metrics`
    pub health_addr: SocketAddr,
}

impl ControllerConfig {
    /// Read the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty());
        let backoff_min_seconds = parse_var(&lookup, "IPAM_BACKOFF_MIN_SECONDS", DEFAULT_BACKOFF_MIN_SECONDS)?;
        let backoff_max_seconds = parse_var(&lookup, "IPAM_BACKOFF_MAX_SECONDS", DEFAULT_BACKOFF_MAX_SECONDS)?;
        let resync_seconds = parse_var(&lookup, "IPAM_RESYNC_SECONDS", DEFAULT_RESYNC_SECONDS)?;
        let concurrency = parse_var(&lookup, "IPAM_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        let health_addr = match lookup("IPAM_HEALTH_ADDR") {
            Some(raw) => parse_value("IPAM_HEALTH_ADDR", &raw)?,
            None => parse_value("IPAM_HEALTH_ADDR", DEFAULT_HEALTH_ADDR)?,
        };

        if backoff_min_seconds == 0 {
            return Err(ControllerError::InvalidConfig(
                "IPAM_BACKOFF_MIN_SECONDS must be greater than zero".to_string(),
            ));
        }
        if backoff_max_seconds < backoff_min_seconds {
            return Err(ControllerError::InvalidConfig(format!(
                "IPAM_BACKOFF_MAX_SECONDS ({backoff_max_seconds}) is below IPAM_BACKOFF_MIN_SECONDS ({backoff_min_seconds})"
            )));
        }
        if resync_seconds == 0 {
            return Err(ControllerError::InvalidConfig(
                "IPAM_RESYNC_SECONDS must be greater than zero".to_string(),
            ));
        }
        if concurrency == 0 {
            return Err(ControllerError::InvalidConfig(
                "IPAM_CONCURRENCY must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            namespace,
            backoff_min_seconds,
            backoff_max_seconds,
            resync: Duration::from_secs(resync_seconds),
            concurrency,
            health_addr,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ControllerError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ControllerError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}
