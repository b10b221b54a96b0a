//! Retry sweep for sagas that stopped moving.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use store::Store;
use tokio::sync::watch;

use crate::coordinator::PixSagaOrchestrator;
use crate::error::Result;
use crate::gateway::SettlementGateway;
use crate::saga::PixSaga;
use crate::state::PixSagaStatus;

/// Sweep settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Pause between sweeps.
    pub sweep_interval: Duration,
    /// Minimum time since the last transition before a saga is resumed.
    pub stale_after: Duration,
    /// Maximum sagas resumed per status and sweep.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale sagas found.
    pub examined: usize,
    /// Sagas that moved to another status.
    pub advanced: usize,
    /// Sagas whose step failed again.
    pub failed: usize,
}

/// Resumes sagas left in a non-terminal status.
///
/// A saga is stale when it has been Created, BalanceLocked, or Failed while
/// still holding funds for longer than `stale_after`. Each one is handed to
/// [`PixSagaOrchestrator::advance`]. Resuming is safe at least once and any
/// number of times: every step starts from the persisted status and commits
/// conditionally on the saga version, and the gateway is keyed on the saga
/// id.
pub struct SagaReaper<S: Store, G: SettlementGateway> {
    orchestrator: Arc<PixSagaOrchestrator<S, G>>,
    config: ReaperConfig,
}

impl<S: Store, G: SettlementGateway> SagaReaper<S, G> {
    pub fn new(orchestrator: Arc<PixSagaOrchestrator<S, G>>, config: ReaperConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Runs one sweep.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let updated_before = older_than(Utc::now(), self.config.stale_after);
        let mut report = SweepReport::default();

        for status in [
            PixSagaStatus::Created,
            PixSagaStatus::BalanceLocked,
            PixSagaStatus::Failed,
        ] {
            let store = self.orchestrator.store();
            let records = match status {
                // Refused sagas hold no funds; filtering them in the query
                // keeps them from filling the batch.
                PixSagaStatus::Failed => {
                    store
                        .sagas_awaiting_compensation(updated_before, self.config.batch_size)
                        .await?
                }
                _ => {
                    store
                        .sagas_by_status(status.as_str(), updated_before, self.config.batch_size)
                        .await?
                }
            };

            for record in records {
                let saga = PixSaga::try_from(record)?;
                report.examined += 1;

                match self.orchestrator.advance(saga.id()).await {
                    Ok(reached) if reached != status => report.advanced += 1,
                    Ok(_) => {}
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(saga_id = %saga.id(), %status, error = %e, "stale saga did not advance");
                    }
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                advanced = report.advanced,
                failed = report.failed,
                "saga sweep complete"
            );
        }
        Ok(report)
    }

    /// Sweeps every `sweep_interval` until `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.config.sweep_interval, "saga reaper started");
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "saga sweep failed");
                    }
                }
            }
        }

        tracing::info!("saga reaper stopped");
    }
}

/// The instant `age` before `now`, saturating at the earliest time.
fn older_than(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
