//! Command deduplication.
//!
//! Inserting the idempotency record is the lock: the store's unique key on
//! `(tenant, command id)` lets exactly one execution through. The lock and the
//! completion are written through the command's session, so a crash between
//! them rolls back the lock together with the side effects. Sessions that
//! cannot roll back release the lock explicitly when the command fails.

use common::{CommandId, TenantId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use store::{IdempotencyRecord, Session, Store, StoreError};

use crate::error::{DomainError, Result};
use crate::regulatory::OperationType;

/// Result of trying to take the idempotency lock.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// No record existed; the caller executes the command.
    Acquired,
    /// The command already ran; this is its recorded result.
    Completed(serde_json::Value),
    /// Another execution holds the lock and has not finished.
    InProgress,
}

/// Caller-visible outcome of a deduplicated command.
///
/// Duplicates are not errors: a replay carries the first execution's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandOutcome<T> {
    /// The command ran now.
    Executed(T),
    /// The command ran before; this is the recorded result.
    Replayed(T),
    /// The command is still running elsewhere. Retry later.
    InProgress,
}

impl<T> CommandOutcome<T> {
    /// Returns the result, whether fresh or replayed.
    pub fn value(&self) -> Option<&T> {
        match self {
            CommandOutcome::Executed(value) | CommandOutcome::Replayed(value) => Some(value),
            CommandOutcome::InProgress => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            CommandOutcome::Executed(value) | CommandOutcome::Replayed(value) => Some(value),
            CommandOutcome::InProgress => None,
        }
    }

    pub fn is_replayed(&self) -> bool {
        matches!(self, CommandOutcome::Replayed(_))
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, CommandOutcome::InProgress)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CommandOutcome<U> {
        match self {
            CommandOutcome::Executed(value) => CommandOutcome::Executed(f(value)),
            CommandOutcome::Replayed(value) => CommandOutcome::Replayed(f(value)),
            CommandOutcome::InProgress => CommandOutcome::InProgress,
        }
    }
}

/// Attempts to take the lock for `command_id` within `tenant_id`.
///
/// Fails with [`DomainError::CommandIdReused`] when the tenant already used
/// the id for another operation.
pub async fn try_lock<S: Session>(
    session: &mut S,
    tenant_id: TenantId,
    command_id: &CommandId,
    operation: OperationType,
) -> Result<LockOutcome> {
    let record = IdempotencyRecord::in_progress(tenant_id, command_id.clone(), operation.as_str());
    if session.insert_idempotency(&record).await? {
        return Ok(LockOutcome::Acquired);
    }

    let existing = session.get_idempotency(tenant_id, command_id).await?;
    outcome_of(existing, operation)
}

/// Records the successful result of the command holding the lock.
pub async fn complete<S, T>(
    session: &mut S,
    tenant_id: TenantId,
    command_id: &CommandId,
    result: &T,
) -> Result<()>
where
    S: Session,
    T: Serialize + Sync,
{
    let value = serde_json::to_value(result)?;
    session
        .complete_idempotency(tenant_id, command_id, true, &value)
        .await?;
    Ok(())
}

/// Maps a stored record to the outcome a duplicate `operation` observes.
pub fn outcome_of(
    record: Option<IdempotencyRecord>,
    operation: OperationType,
) -> Result<LockOutcome> {
    match record {
        Some(record) if record.operation_type != operation.as_str() => {
            Err(DomainError::CommandIdReused {
                command_id: record.id,
                recorded: record.operation_type,
                requested: operation.as_str(),
            })
        }
        Some(IdempotencyRecord {
            success: true,
            result: Some(result),
            ..
        }) => Ok(LockOutcome::Completed(result)),
        _ => Ok(LockOutcome::InProgress),
    }
}

/// Converts a non-acquired lock into the caller-visible outcome.
pub fn replay<T: DeserializeOwned>(outcome: LockOutcome) -> Result<CommandOutcome<T>> {
    match outcome {
        LockOutcome::Completed(result) => {
            metrics::counter!("commands_replayed_total").increment(1);
            Ok(CommandOutcome::Replayed(serde_json::from_value(result)?))
        }
        LockOutcome::Acquired | LockOutcome::InProgress => Ok(CommandOutcome::InProgress),
    }
}

/// Commits or aborts a command's session and reports the outcome.
///
/// On success the session is committed. When the commit loses the
/// idempotency-key race to a concurrent execution of the same command, the
/// winner's recorded result is returned instead. Any error aborts the
/// session before it is propagated; a non-atomic session first deletes the
/// lock it took so the command can be retried.
pub async fn finish_command<S, T>(
    store: &S,
    mut session: S::Session,
    tenant_id: TenantId,
    command_id: &CommandId,
    operation: OperationType,
    result: Result<CommandOutcome<T>>,
) -> Result<CommandOutcome<T>>
where
    S: Store,
    T: DeserializeOwned,
{
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if !session.mode().is_atomic() {
                match session.release_idempotency(tenant_id, command_id).await {
                    Ok(true) => tracing::debug!(%command_id, "released lock of failed command"),
                    Ok(false) => {}
                    Err(release_err) => {
                        tracing::warn!(%command_id, error = %release_err, "failed to release lock");
                    }
                }
            }
            if let Err(abort_err) = session.abort().await {
                tracing::warn!(error = %abort_err, "failed to abort session");
            }
            return Err(observe(e));
        }
    };

    match session.commit().await {
        Ok(()) => {
            if matches!(outcome, CommandOutcome::Executed(_)) {
                metrics::counter!("commands_total", "operation" => operation.as_str())
                    .increment(1);
            }
            Ok(outcome)
        }
        Err(StoreError::DuplicateKey {
            entity: "idempotency record",
            ..
        }) => {
            tracing::info!(%command_id, "concurrent duplicate command committed first");
            let record = store.get_idempotency(tenant_id, command_id).await?;
            replay(outcome_of(record, operation)?)
        }
        Err(e) => Err(observe(e.into())),
    }
}

fn observe(e: DomainError) -> DomainError {
    if e.is_retryable() {
        metrics::counter!("concurrency_conflicts_total").increment(1);
        tracing::warn!(error = %e, "command lost a concurrent update");
    }
    e
}

#[cfg(test)]
mod tests {
    use store::{InMemoryStore, Store};

    use super::*;

    #[tokio::test]
    async fn first_lock_is_acquired_then_replayed() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let id = CommandId::from("cmd-1");

        let mut session = store.begin().await.unwrap();
        assert_eq!(
            try_lock(&mut session, tenant, &id, OperationType::Debit).await.unwrap(),
            LockOutcome::Acquired
        );
        complete(&mut session, tenant, &id, &serde_json::json!({ "balance": "60" }))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let mut session = store.begin().await.unwrap();
        let outcome = try_lock(&mut session, tenant, &id, OperationType::Debit)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            LockOutcome::Completed(serde_json::json!({ "balance": "60" }))
        );

        let replayed: CommandOutcome<serde_json::Value> = replay(outcome).unwrap();
        assert!(replayed.is_replayed());
    }

    #[tokio::test]
    async fn uncompleted_lock_reports_in_progress() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let id = CommandId::from("cmd-2");

        let mut session = store.begin().await.unwrap();
        try_lock(&mut session, tenant, &id, OperationType::Credit)
            .await
            .unwrap();
        assert_eq!(
            try_lock(&mut session, tenant, &id, OperationType::Credit).await.unwrap(),
            LockOutcome::InProgress
        );
    }

    #[tokio::test]
    async fn aborted_lock_is_released() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let id = CommandId::from("cmd-3");

        let mut session = store.begin().await.unwrap();
        try_lock(&mut session, tenant, &id, OperationType::Debit)
            .await
            .unwrap();
        session.abort().await.unwrap();

        let mut session = store.begin().await.unwrap();
        assert_eq!(
            try_lock(&mut session, tenant, &id, OperationType::Debit).await.unwrap(),
            LockOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn lock_is_scoped_to_the_tenant() {
        let store = InMemoryStore::new();
        let id = CommandId::from("cmd-4");

        let mut session = store.begin().await.unwrap();
        try_lock(&mut session, TenantId::new(), &id, OperationType::Credit)
            .await
            .unwrap();
        assert_eq!(
            try_lock(&mut session, TenantId::new(), &id, OperationType::Debit)
                .await
                .unwrap(),
            LockOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn reuse_for_another_operation_is_rejected() {
        let store = InMemoryStore::new();
        let tenant = TenantId::new();
        let id = CommandId::from("cmd-5");

        let mut session = store.begin().await.unwrap();
        try_lock(&mut session, tenant, &id, OperationType::Debit)
            .await
            .unwrap();
        complete(&mut session, tenant, &id, &serde_json::json!({ "balance": "60" }))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let mut session = store.begin().await.unwrap();
        let err = try_lock(&mut session, tenant, &id, OperationType::Transfer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::CommandIdReused { ref recorded, requested: "TRANSFER", .. }
                if recorded == "DEBIT"
        ));
    }

    #[tokio::test]
    async fn failed_non_atomic_command_releases_its_lock() {
        let store = InMemoryStore::without_transactions();
        let tenant = TenantId::new();
        let id = CommandId::from("cmd-6");

        let mut session = store.begin().await.unwrap();
        try_lock(&mut session, tenant, &id, OperationType::Debit)
            .await
            .unwrap();
        let failed: Result<CommandOutcome<serde_json::Value>> =
            Err(DomainError::Validation("amount must be positive".to_string()));
        finish_command(&store, session, tenant, &id, OperationType::Debit, failed)
            .await
            .unwrap_err();

        assert!(store.get_idempotency(tenant, &id).await.unwrap().is_none());
    }

    #[test]
    fn outcome_helpers() {
        let executed = CommandOutcome::Executed(5);
        assert_eq!(executed.value(), Some(&5));
        assert_eq!(executed.clone().map(|v| v * 2), CommandOutcome::Executed(10));
        assert!(!executed.is_replayed());
        assert_eq!(CommandOutcome::<i32>::InProgress.into_value(), None);
    }
}
