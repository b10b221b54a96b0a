use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    AccountDocument, AccountId, CommandId, CorrelationId, IdempotencyRecord, LedgerEvent,
    MessageId, OutboxMessage, Result, SagaId, SagaRecord, TenantId, Version,
};

/// Whether a session's writes become visible together or one by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// All writes of the session commit or roll back together.
    Atomic,
    /// Degraded mode for store instances without multi-statement transactions.
    /// Writes are applied as they are issued, `commit` is a no-op and `abort`
    /// cannot undo anything.
    NonAtomic,
}

impl TransactionMode {
    pub fn is_atomic(&self) -> bool {
        matches!(self, TransactionMode::Atomic)
    }
}

/// A unit of work.
///
/// Every read and write issued through a session is routed through the same
/// store transaction. Dropping an atomic session without calling
/// [`Session::commit`] discards its writes.
#[async_trait]
pub trait Session: Send {
    /// Returns whether this session is atomic or degraded.
    fn mode(&self) -> TransactionMode;

    /// Fetches an account document.
    async fn load_account(&mut self, id: AccountId) -> Result<Option<AccountDocument>>;

    /// Inserts a new account document.
    ///
    /// Fails with `DuplicateKey` if the id is taken.
    async fn insert_account(&mut self, account: &AccountDocument) -> Result<()>;

    /// Conditionally replaces an account document.
    ///
    /// The write is accepted only if the stored version equals `expected`;
    /// `account.version` is the version written. Returns the number of
    /// documents modified (0 when the stored version has moved on).
    async fn update_account(&mut self, account: &AccountDocument, expected: Version)
    -> Result<u64>;

    /// Appends a ledger event.
    async fn append_ledger(&mut self, event: &LedgerEvent) -> Result<()>;

    /// Stages an outbox message.
    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<()>;

    /// Inserts an idempotency record if the tenant has no record with the
    /// same command id. Returns false when a record already exists.
    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<bool>;

    /// Fetches an idempotency record.
    async fn get_idempotency(
        &mut self,
        tenant_id: TenantId,
        id: &CommandId,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Records the final outcome of a command.
    async fn complete_idempotency(
        &mut self,
        tenant_id: TenantId,
        id: &CommandId,
        success: bool,
        result: &serde_json::Value,
    ) -> Result<()>;

    /// Deletes an uncompleted idempotency record inserted by this session.
    ///
    /// Used where [`Session::abort`] cannot undo the insert. Records written
    /// by other sessions are never touched. Returns true when a record was
    /// removed.
    async fn release_idempotency(&mut self, tenant_id: TenantId, id: &CommandId) -> Result<bool>;

    /// Fetches a saga record.
    async fn load_saga(&mut self, id: SagaId) -> Result<Option<SagaRecord>>;

    /// Inserts a new saga record.
    async fn insert_saga(&mut self, saga: &SagaRecord) -> Result<()>;

    /// Conditionally replaces a saga record; same contract as
    /// [`Session::update_account`].
    async fn update_saga(&mut self, saga: &SagaRecord, expected: Version) -> Result<u64>;

    /// Makes every write of the session visible.
    async fn commit(self) -> Result<()>;

    /// Discards every write of the session.
    async fn abort(self) -> Result<()>;
}

/// A store that hands out sessions and serves the non-transactional
/// operations of background workers and read paths.
#[async_trait]
pub trait Store: Send + Sync {
    /// The session type opened by [`Store::begin`].
    type Session: Session;

    /// Returns the mode sessions of this store run in.
    fn mode(&self) -> TransactionMode;

    /// Opens a new unit of work.
    async fn begin(&self) -> Result<Self::Session>;

    /// Reads the committed state of an account.
    async fn get_account(&self, id: AccountId) -> Result<Option<AccountDocument>>;

    /// Returns the ledger history of an account, oldest first.
    async fn ledger_for_account(&self, id: AccountId) -> Result<Vec<LedgerEvent>>;

    /// Returns every ledger event of one logical operation, oldest first.
    async fn ledger_for_correlation(&self, id: CorrelationId) -> Result<Vec<LedgerEvent>>;

    /// Reads the committed idempotency record of a command.
    async fn get_idempotency(
        &self,
        tenant_id: TenantId,
        id: &CommandId,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Reads the committed state of a saga.
    async fn get_saga(&self, id: SagaId) -> Result<Option<SagaRecord>>;

    /// Returns up to `limit` sagas in `status` last updated before
    /// `updated_before`, least recently updated first.
    async fn sagas_by_status(
        &self,
        status: &str,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>>;

    /// Returns up to `limit` failed sagas still holding locked funds, last
    /// updated before `updated_before`, least recently updated first.
    async fn sagas_awaiting_compensation(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>>;

    /// Returns every outbox message not yet processed, oldest first.
    async fn pending_outbox(&self) -> Result<Vec<OutboxMessage>>;

    /// Reads one outbox message.
    async fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>>;

    /// Atomically claims up to `limit` claimable messages for `worker_id`.
    ///
    /// Claimable messages are unprocessed, due (`next_attempt_at <= now`) and
    /// either unlocked or locked before `lock_expired_before`. Messages are
    /// returned oldest first.
    async fn claim_outbox_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lock_expired_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>>;

    /// Marks a message processed. Returns false if `worker_id` no longer
    /// holds its lock.
    async fn mark_outbox_processed(&self, id: MessageId, worker_id: &str) -> Result<bool>;

    /// Releases the lock after a failed publish, counting the attempt and
    /// deferring the next claim until `next_attempt_at`. Returns false if
    /// `worker_id` no longer holds the lock.
    async fn release_outbox_lock(
        &self,
        id: MessageId,
        worker_id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool>;

    /// Returns unprocessed messages whose lock was taken before `locked_before`.
    async fn stale_outbox_locks(&self, locked_before: DateTime<Utc>)
    -> Result<Vec<OutboxMessage>>;
}
