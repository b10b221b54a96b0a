//! Dispatcher settings.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Settings of one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Identity written into message locks. Must be unique per instance.
    pub worker_id: String,
    /// Maximum messages claimed per cycle.
    pub batch_size: usize,
    /// Pause between cycles that found less than a full batch.
    pub poll_interval: Duration,
    /// Age after which a lock is considered abandoned.
    pub lock_timeout: Duration,
    /// Maximum publishes in flight per cycle.
    pub publish_concurrency: usize,
    /// Backoff for failed publishes.
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("dispatcher-{}", std::process::id()),
            batch_size: 50,
            poll_interval: Duration::from_millis(500),
            lock_timeout: Duration::from_secs(60),
            publish_concurrency: 8,
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    /// Default settings under a given worker identity.
    pub fn for_worker(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }
}
