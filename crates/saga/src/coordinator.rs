//! Pix saga orchestrator.

use std::time::{Duration, Instant};

use common::SagaId;
use domain::idempotency::{self, CommandOutcome, LockOutcome};
use domain::ledger::{self, LedgerEntry, LedgerEventType};
use domain::outbox::{self, topics};
use domain::regulatory::{OperationType, RegulatoryPack, RegulatoryRegistry, TenantContext};
use domain::service::{ensure_positive, pack_for, validate};
use domain::{Account, DomainError, Money, repository as accounts};
use store::{Session, Store};

use crate::commands::SendPix;
use crate::error::{Result, SagaError};
use crate::events::PixSagaEvent;
use crate::gateway::{SettlementGateway, SettlementOutcome, SettlementRequest};
use crate::repository;
use crate::saga::PixSaga;
use crate::state::PixSagaStatus;

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on one gateway call.
    pub gateway_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(5),
        }
    }
}

/// Status change produced by one step.
#[derive(Debug, Clone, Copy)]
struct Transition {
    from: PixSagaStatus,
    to: PixSagaStatus,
}

impl Transition {
    fn none(status: PixSagaStatus) -> Self {
        Self {
            from: status,
            to: status,
        }
    }
}

/// Drives Pix payments through lock -> settle -> complete or refund.
///
/// Every step starts by reloading the saga and does nothing unless the saga
/// is in that step's starting status, so any step may be re-invoked after a
/// crash, a redelivered message or a sweep. Local writes of a step commit
/// together with the saga's conditional version write. The gateway call
/// happens outside any session.
pub struct PixSagaOrchestrator<S, G>
where
    S: Store,
    G: SettlementGateway,
{
    store: S,
    gateway: G,
    regulatory: RegulatoryRegistry,
    config: OrchestratorConfig,
}

impl<S, G> PixSagaOrchestrator<S, G>
where
    S: Store,
    G: SettlementGateway,
{
    /// Creates a new orchestrator.
    pub fn new(
        store: S,
        gateway: G,
        regulatory: RegulatoryRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            regulatory,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Validates and persists a new saga, staging `saga-created`.
    ///
    /// No money moves here. Retrying with the same command id returns the
    /// saga created the first time.
    #[tracing::instrument(skip(self, ctx, cmd), fields(tenant_id = %ctx.tenant_id, account_id = %cmd.account_id))]
    pub async fn start(&self, ctx: &TenantContext, cmd: SendPix) -> Result<CommandOutcome<SagaId>> {
        ensure_positive(&cmd.amount)?;
        if cmd.pix_key.trim().is_empty() {
            return Err(DomainError::Validation("pix key must not be empty".to_string()).into());
        }
        let pack = pack_for(&self.regulatory, ctx)?;

        let mut session = self.store.begin().await?;
        let result = self
            .apply_start(&mut session, ctx, pack.as_ref(), &cmd)
            .await;
        let outcome = idempotency::finish_command(
            &self.store,
            session,
            ctx.tenant_id,
            &cmd.command_id,
            OperationType::Pix,
            result,
        )
        .await?;

        if let CommandOutcome::Executed(saga_id) = &outcome {
            record_transition(*saga_id, PixSagaStatus::Created);
        }
        Ok(outcome)
    }

    /// Reads the committed state of a saga.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<PixSaga> {
        let record = self
            .store
            .get_saga(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))?;
        PixSaga::try_from(record)
    }

    /// Step 1: debits the source account.
    ///
    /// Created -> BalanceLocked with the debit, a `DEBIT` ledger entry and
    /// `saga-locked` in one session; or Created -> Failed when the account
    /// refuses the debit, with no funds moved.
    #[tracing::instrument(skip(self))]
    pub async fn lock_balance(&self, saga_id: SagaId) -> Result<PixSagaStatus> {
        let mut session = self.store.begin().await?;
        let result = self.apply_lock(&mut session, saga_id).await;
        finish(session, saga_id, result).await
    }

    /// Step 2: calls the gateway for a balance-locked saga.
    ///
    /// Acceptance completes the saga. Rejection fails it and then runs
    /// [`Self::compensate`]. A timeout or technical error leaves the saga
    /// untouched and is returned as a retryable error.
    #[tracing::instrument(skip(self))]
    pub async fn settle(&self, saga_id: SagaId) -> Result<PixSagaStatus> {
        let saga = self.get_saga(saga_id).await?;
        if !saga.status().can_settle() {
            tracing::debug!(status = %saga.status(), "saga not awaiting settlement");
            return Ok(saga.status());
        }

        let request = SettlementRequest {
            saga_id,
            pix_key: saga.pix_key().to_string(),
            amount: saga.amount(),
        };
        let started = Instant::now();
        let response =
            tokio::time::timeout(self.config.gateway_timeout, self.gateway.send(&request)).await;
        metrics::histogram!("saga_settlement_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let outcome = match response {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                metrics::counter!("saga_gateway_failures_total").increment(1);
                tracing::warn!(error = %e, "gateway call failed; saga stays balance-locked");
                return Err(e.into());
            }
            Err(_) => {
                metrics::counter!("saga_gateway_failures_total").increment(1);
                tracing::warn!(
                    timeout = ?self.config.gateway_timeout,
                    "gateway call timed out; saga stays balance-locked"
                );
                return Err(SagaError::GatewayTimeout(self.config.gateway_timeout));
            }
        };

        match outcome {
            SettlementOutcome::Accepted { transaction_id } => {
                let mut session = self.store.begin().await?;
                let result = self
                    .apply_complete(&mut session, saga_id, &transaction_id)
                    .await;
                finish(session, saga_id, result).await
            }
            SettlementOutcome::Rejected { error_code } => {
                let mut session = self.store.begin().await?;
                let result = self
                    .apply_reject(&mut session, saga_id, &error_code)
                    .await;
                finish(session, saga_id, result).await?;
                self.compensate(saga_id).await
            }
        }
    }

    /// Returns the locked funds of a failed saga: credit back, `REFUND`
    /// ledger entry, `saga-refunded` and Failed -> Refunded in one session.
    #[tracing::instrument(skip(self))]
    pub async fn compensate(&self, saga_id: SagaId) -> Result<PixSagaStatus> {
        let mut session = self.store.begin().await?;
        let result = self.apply_compensate(&mut session, saga_id).await;
        finish(session, saga_id, result).await.inspect_err(|e| {
            tracing::error!(error = %e, "compensation failed; saga keeps its locked funds");
        })
    }

    /// Runs whatever step the persisted status calls for until the saga is
    /// terminal or stops moving.
    #[tracing::instrument(skip(self))]
    pub async fn advance(&self, saga_id: SagaId) -> Result<PixSagaStatus> {
        let mut status = self.get_saga(saga_id).await?.status();
        loop {
            let next = match status {
                PixSagaStatus::Created => self.lock_balance(saga_id).await?,
                PixSagaStatus::BalanceLocked => self.settle(saga_id).await?,
                PixSagaStatus::Failed => self.compensate(saga_id).await?,
                PixSagaStatus::Completed | PixSagaStatus::Refunded => return Ok(status),
            };
            if next == status {
                return Ok(next);
            }
            status = next;
        }
    }

    async fn apply_start(
        &self,
        session: &mut S::Session,
        ctx: &TenantContext,
        pack: &dyn RegulatoryPack,
        cmd: &SendPix,
    ) -> domain::Result<CommandOutcome<SagaId>> {
        let lock =
            idempotency::try_lock(session, ctx.tenant_id, &cmd.command_id, OperationType::Pix)
                .await?;
        if lock != LockOutcome::Acquired {
            return idempotency::replay(lock);
        }

        let account = accounts::load_account(session, ctx.tenant_id, cmd.account_id).await?;
        validate(pack, &account, &cmd.amount, OperationType::Pix)?;
        let tax = pack.calculate_tax(&cmd.amount, OperationType::Pix)?;

        let mut saga = PixSaga::new(
            ctx.tenant_id,
            account.id(),
            cmd.amount,
            tax,
            cmd.pix_key.clone(),
        );
        repository::insert(session, &mut saga).await?;

        outbox::enqueue(
            session,
            ctx.tenant_id,
            topics::PIX_SAGA,
            &PixSagaEvent::SagaCreated {
                saga_id: saga.id(),
                account_id: saga.account_id(),
                amount: saga.amount(),
                pix_key: saga.pix_key().to_string(),
            },
        )
        .await?;

        idempotency::complete(session, ctx.tenant_id, &cmd.command_id, &saga.id()).await?;
        tracing::info!(saga_id = %saga.id(), amount = %cmd.amount, "pix saga created");
        Ok(CommandOutcome::Executed(saga.id()))
    }

    async fn apply_lock(&self, session: &mut S::Session, saga_id: SagaId) -> Result<Transition> {
        let mut saga = repository::load(session, saga_id).await?;
        let from = saga.status();
        if !from.can_lock() {
            tracing::debug!(status = %from, "saga already past the lock step");
            return Ok(Transition::none(from));
        }

        let total = saga.total()?;
        let mut account = match debit_source(session, &saga, &total).await {
            Ok(account) => account,
            Err(e) if is_refusal(&e) => {
                let reason = e.to_string();
                saga.fail(reason.clone())?;
                repository::save(session, &mut saga).await?;
                outbox::enqueue(
                    session,
                    saga.tenant_id(),
                    topics::PIX_SAGA,
                    &PixSagaEvent::SagaFailed { saga_id, reason },
                )
                .await?;
                tracing::warn!(error = %e, "pix debit refused; no funds moved");
                return Ok(Transition {
                    from,
                    to: saga.status(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        accounts::save_account(session, &mut account).await?;
        ledger::append(
            session,
            &account,
            LedgerEntry::new(LedgerEventType::Debit, total, saga.correlation_id())
                .metadata("saga_id", saga_id.to_string())
                .metadata("tax", saga.tax().to_string())
                .metadata("pix_key", saga.pix_key()),
        )
        .await?;

        saga.lock_funds()?;
        repository::save(session, &mut saga).await?;
        outbox::enqueue(
            session,
            saga.tenant_id(),
            topics::PIX_SAGA,
            &PixSagaEvent::SagaLocked {
                saga_id,
                account_id: saga.account_id(),
                debited: total,
            },
        )
        .await?;

        Ok(Transition {
            from,
            to: saga.status(),
        })
    }

    async fn apply_complete(
        &self,
        session: &mut S::Session,
        saga_id: SagaId,
        transaction_id: &str,
    ) -> Result<Transition> {
        let mut saga = repository::load(session, saga_id).await?;
        let from = saga.status();
        if !from.can_settle() {
            return Ok(Transition::none(from));
        }

        saga.complete(transaction_id)?;
        repository::save(session, &mut saga).await?;
        outbox::enqueue(
            session,
            saga.tenant_id(),
            topics::PIX_SAGA,
            &PixSagaEvent::SagaCompleted {
                saga_id,
                settlement_id: transaction_id.to_string(),
            },
        )
        .await?;

        Ok(Transition {
            from,
            to: saga.status(),
        })
    }

    async fn apply_reject(
        &self,
        session: &mut S::Session,
        saga_id: SagaId,
        error_code: &str,
    ) -> Result<Transition> {
        let mut saga = repository::load(session, saga_id).await?;
        let from = saga.status();
        if !from.can_settle() {
            return Ok(Transition::none(from));
        }

        let reason = format!("gateway rejected the payment: {error_code}");
        saga.fail(reason.clone())?;
        repository::save(session, &mut saga).await?;
        outbox::enqueue(
            session,
            saga.tenant_id(),
            topics::PIX_SAGA,
            &PixSagaEvent::SagaFailed { saga_id, reason },
        )
        .await?;

        tracing::warn!(%error_code, "settlement rejected");
        Ok(Transition {
            from,
            to: saga.status(),
        })
    }

    async fn apply_compensate(
        &self,
        session: &mut S::Session,
        saga_id: SagaId,
    ) -> Result<Transition> {
        let mut saga = repository::load(session, saga_id).await?;
        let from = saga.status();
        if !saga.needs_compensation() {
            return Ok(Transition::none(from));
        }

        let total = saga.total()?;
        let mut account =
            accounts::load_account(session, saga.tenant_id(), saga.account_id()).await?;
        account.credit(&total).map_err(DomainError::from)?;
        accounts::save_account(session, &mut account).await?;
        ledger::append(
            session,
            &account,
            LedgerEntry::new(LedgerEventType::Refund, total, saga.correlation_id())
                .metadata("saga_id", saga_id.to_string())
                .metadata("reason", saga.failure_reason().unwrap_or_default()),
        )
        .await?;

        saga.refund()?;
        repository::save(session, &mut saga).await?;
        outbox::enqueue(
            session,
            saga.tenant_id(),
            topics::PIX_SAGA,
            &PixSagaEvent::SagaRefunded {
                saga_id,
                account_id: saga.account_id(),
                refunded: total,
            },
        )
        .await?;

        Ok(Transition {
            from,
            to: saga.status(),
        })
    }
}

/// Loads the source account and applies the debit in memory.
async fn debit_source<T: Session>(
    session: &mut T,
    saga: &PixSaga,
    total: &Money,
) -> domain::Result<Account> {
    let mut account = accounts::load_account(session, saga.tenant_id(), saga.account_id()).await?;
    account.debit(total)?;
    Ok(account)
}

/// Conclusive business refusals fail the saga; anything else is retried.
fn is_refusal(e: &DomainError) -> bool {
    matches!(
        e,
        DomainError::AccountNotFound(_)
            | DomainError::Account(_)
            | DomainError::Money(_)
            | DomainError::RegulatoryRejection { .. }
    )
}

/// Commits a successful step or aborts a failed one.
async fn finish<T: Session>(
    session: T,
    saga_id: SagaId,
    result: Result<Transition>,
) -> Result<PixSagaStatus> {
    let transition = match result {
        Ok(transition) => transition,
        Err(e) => {
            if let Err(abort_err) = session.abort().await {
                tracing::warn!(error = %abort_err, "failed to abort session");
            }
            if matches!(&e, SagaError::Domain(inner) if inner.is_retryable()) {
                metrics::counter!("concurrency_conflicts_total").increment(1);
            }
            return Err(e);
        }
    };

    session.commit().await?;
    if transition.from != transition.to {
        record_transition(saga_id, transition.to);
    }
    Ok(transition.to)
}

fn record_transition(saga_id: SagaId, to: PixSagaStatus) {
    metrics::counter!("saga_transitions_total", "to" => to.as_str()).increment(1);
    tracing::info!(%saga_id, status = %to, "saga transitioned");
}
