//! Outbox dispatcher loop.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use store::{OutboxMessage, Store};
use tokio::sync::watch;

use crate::broker::MessageBroker;
use crate::config::DispatcherConfig;
use crate::error::{BrokerError, Result};

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Messages this worker locked.
    pub claimed: usize,
    /// Messages published and marked processed.
    pub published: usize,
    /// Messages whose publish failed and whose lock was released.
    pub failed: usize,
}

/// Drains the outbox to the broker.
///
/// Each cycle claims a batch (locking it under this worker's id so other
/// instances skip it), publishes the messages, then marks successes
/// processed and releases failures with a backoff. A crash after publishing
/// but before marking leads to a second publish once the lock expires;
/// subscribers must deduplicate.
pub struct OutboxDispatcher<S: Store, B: MessageBroker> {
    store: S,
    broker: B,
    config: DispatcherConfig,
}

impl<S: Store, B: MessageBroker> OutboxDispatcher<S, B> {
    /// Creates a new dispatcher.
    pub fn new(store: S, broker: B, config: DispatcherConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs one claim -> publish -> mark/release cycle.
    #[tracing::instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run_once(&self) -> Result<DispatchReport> {
        let worker_id = self.config.worker_id.as_str();
        let lock_expired_before = older_than(Utc::now(), self.config.lock_timeout);

        let batch = self
            .store
            .claim_outbox_batch(worker_id, self.config.batch_size, lock_expired_before)
            .await?;
        let mut report = DispatchReport {
            claimed: batch.len(),
            ..DispatchReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let results: Vec<(OutboxMessage, std::result::Result<(), BrokerError>)> =
            futures_util::stream::iter(batch)
                .map(|message| async move {
                    let result = self.broker.publish(&message).await;
                    (message, result)
                })
                .buffer_unordered(self.config.publish_concurrency.max(1))
                .collect()
                .await;

        for (message, result) in results {
            match result {
                Ok(()) => {
                    if self.store.mark_outbox_processed(message.id, worker_id).await? {
                        report.published += 1;
                    } else {
                        tracing::warn!(
                            message_id = %message.id,
                            "lock lost before marking; message will be published again"
                        );
                    }
                }
                Err(e) => {
                    self.release(&message, &e).await?;
                    report.failed += 1;
                }
            }
        }

        metrics::counter!("outbox_published_total").increment(report.published as u64);
        tracing::info!(
            claimed = report.claimed,
            published = report.published,
            failed = report.failed,
            "dispatch cycle complete"
        );
        Ok(report)
    }

    /// Releases a failed message, deferring its next claim by the backoff.
    async fn release(&self, message: &OutboxMessage, error: &BrokerError) -> Result<()> {
        let previous_failures = u32::try_from(message.attempts).unwrap_or(0);
        let failures = previous_failures.saturating_add(1);
        let delay = self.config.retry.delay_for_attempt(previous_failures);
        let now = Utc::now();
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let released = self
            .store
            .release_outbox_lock(
                message.id,
                &self.config.worker_id,
                next_attempt_at,
                &error.to_string(),
            )
            .await?;
        if !released {
            tracing::warn!(message_id = %message.id, "lock lost before release");
        }

        metrics::counter!("outbox_publish_failures_total").increment(1);
        if self.config.retry.is_poison(failures) {
            metrics::counter!("outbox_poison_messages_total").increment(1);
            tracing::error!(
                message_id = %message.id,
                topic = %message.topic,
                attempts = failures,
                %error,
                "outbox message keeps failing to publish"
            );
        } else {
            tracing::warn!(
                message_id = %message.id,
                topic = %message.topic,
                attempts = failures,
                retry_in = ?delay,
                %error,
                "publish failed; lock released"
            );
        }
        Ok(())
    }

    /// Reports messages whose lock is older than the lock timeout.
    ///
    /// They are claimable again; a message that keeps showing up here points
    /// at a dispatcher that crashes while handling it.
    #[tracing::instrument(skip(self))]
    pub async fn check_stale_locks(&self) -> Result<Vec<OutboxMessage>> {
        let locked_before = older_than(Utc::now(), self.config.lock_timeout);
        let stale = self.store.stale_outbox_locks(locked_before).await?;

        metrics::gauge!("outbox_stale_locks").set(stale.len() as f64);
        for message in &stale {
            tracing::warn!(
                message_id = %message.id,
                locked_by = ?message.locked_by,
                locked_at = ?message.locked_at,
                attempts = message.attempts,
                "outbox lock outlived its timeout"
            );
        }
        Ok(stale)
    }

    /// Dispatches until `shutdown` flips to true or its sender is dropped.
    ///
    /// A full batch is followed immediately by the next cycle; otherwise the
    /// loop sleeps for the poll interval. Store errors are logged and the
    /// loop carries on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            "outbox dispatcher started"
        );
        let mut last_stale_check = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let full_batch = match self.run_once().await {
                Ok(report) => report.claimed >= self.config.batch_size,
                Err(e) => {
                    tracing::error!(error = %e, "dispatch cycle failed");
                    false
                }
            };

            if last_stale_check.elapsed() >= self.config.lock_timeout {
                if let Err(e) = self.check_stale_locks().await {
                    tracing::error!(error = %e, "stale lock check failed");
                }
                last_stale_check = Instant::now();
            }

            if full_batch {
                continue;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!(worker_id = %self.config.worker_id, "outbox dispatcher stopped");
    }
}

/// The instant `age` before `now`, saturating at the earliest time.
fn older_than(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
