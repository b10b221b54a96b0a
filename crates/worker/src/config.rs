//! Worker configuration loaded from environment variables.

use std::time::Duration;

use dispatcher::{DispatcherConfig, RetryPolicy};
use saga::{OrchestratorConfig, ReaperConfig};

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address of the health and metrics server
///   (default: `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; unset runs on the
///   in-memory store
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `ATOMIC_TRANSACTIONS`: `false` runs the store in degraded mode
/// - `WORKER_ID`: identity stamped on outbox locks
/// - `OUTBOX_BATCH_SIZE`, `OUTBOX_POLL_INTERVAL_MS`, `OUTBOX_LOCK_TIMEOUT_SECS`,
///   `OUTBOX_PUBLISH_CONCURRENCY`, `OUTBOX_MAX_ATTEMPTS_BEFORE_ALERT`
/// - `SAGA_SWEEP_INTERVAL_SECS`, `SAGA_STALE_AFTER_SECS`, `GATEWAY_TIMEOUT_MS`
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub atomic_transactions: bool,
    pub worker_id: String,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
    pub outbox_lock_timeout: Duration,
    pub outbox_publish_concurrency: usize,
    pub outbox_max_attempts_before_alert: u32,
    pub saga_sweep_interval: Duration,
    pub saga_stale_after: Duration,
    pub gateway_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: lookup("DATABASE_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.database_max_connections),
            atomic_transactions: lookup("ATOMIC_TRANSACTIONS")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(defaults.atomic_transactions),
            worker_id: lookup("WORKER_ID").unwrap_or(defaults.worker_id),
            outbox_batch_size: parse("OUTBOX_BATCH_SIZE")
                .map(|v| v as usize)
                .unwrap_or(defaults.outbox_batch_size),
            outbox_poll_interval: parse("OUTBOX_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.outbox_poll_interval),
            outbox_lock_timeout: parse("OUTBOX_LOCK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.outbox_lock_timeout),
            outbox_publish_concurrency: parse("OUTBOX_PUBLISH_CONCURRENCY")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.outbox_publish_concurrency),
            outbox_max_attempts_before_alert: lookup("OUTBOX_MAX_ATTEMPTS_BEFORE_ALERT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.outbox_max_attempts_before_alert),
            saga_sweep_interval: parse("SAGA_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.saga_sweep_interval),
            saga_stale_after: parse("SAGA_STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.saga_stale_after),
            gateway_timeout: parse("GATEWAY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.gateway_timeout),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_id: self.worker_id.clone(),
            batch_size: self.outbox_batch_size,
            poll_interval: self.outbox_poll_interval,
            lock_timeout: self.outbox_lock_timeout,
            publish_concurrency: self.outbox_publish_concurrency,
            retry: RetryPolicy {
                max_attempts_before_alert: self.outbox_max_attempts_before_alert,
                ..RetryPolicy::default()
            },
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            sweep_interval: self.saga_sweep_interval,
            stale_after: self.saga_stale_after,
            ..ReaperConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            gateway_timeout: self.gateway_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        let reaper = ReaperConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            database_max_connections: 10,
            atomic_transactions: true,
            worker_id: dispatcher.worker_id,
            outbox_batch_size: dispatcher.batch_size,
            outbox_poll_interval: dispatcher.poll_interval,
            outbox_lock_timeout: dispatcher.lock_timeout,
            outbox_publish_concurrency: dispatcher.publish_concurrency,
            outbox_max_attempts_before_alert: dispatcher.retry.max_attempts_before_alert,
            saga_sweep_interval: reaper.sweep_interval,
            saga_stale_after: reaper.stale_after,
            gateway_timeout: OrchestratorConfig::default().gateway_timeout,
        }
    }
}
