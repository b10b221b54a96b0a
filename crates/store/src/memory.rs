use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    AccountDocument, AccountId, CommandId, CorrelationId, IdempotencyRecord, LedgerEvent,
    MessageId, OutboxMessage, Result, SagaId, SagaRecord, StoreError, TenantId, Version,
    store::{Session, Store, TransactionMode},
};

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<AccountId, AccountDocument>,
    ledger: Vec<LedgerEvent>,
    outbox: Vec<OutboxMessage>,
    idempotency: HashMap<(TenantId, CommandId), IdempotencyRecord>,
    sagas: HashMap<SagaId, SagaRecord>,
}

/// A write staged by a session.
#[derive(Debug, Clone)]
enum Write {
    InsertAccount(AccountDocument),
    UpdateAccount {
        account: AccountDocument,
        expected: Version,
    },
    AppendLedger(LedgerEvent),
    EnqueueOutbox(OutboxMessage),
    InsertIdempotency(IdempotencyRecord),
    CompleteIdempotency {
        tenant_id: TenantId,
        id: CommandId,
        success: bool,
        result: serde_json::Value,
    },
    ReleaseIdempotency {
        tenant_id: TenantId,
        id: CommandId,
    },
    InsertSaga(SagaRecord),
    UpdateSaga {
        saga: SagaRecord,
        expected: Version,
    },
}

impl State {
    /// Checks that `writes`, applied in order on top of the committed state,
    /// would all be accepted.
    fn validate(&self, writes: &[Write]) -> Result<()> {
        let mut account_versions: HashMap<AccountId, Version> = HashMap::new();
        let mut saga_versions: HashMap<SagaId, Version> = HashMap::new();
        let mut idempotency_keys: HashSet<(TenantId, &CommandId)> = HashSet::new();

        for write in writes {
            match write {
                Write::InsertAccount(account) => {
                    if self.accounts.contains_key(&account.id)
                        || account_versions.contains_key(&account.id)
                    {
                        return Err(StoreError::DuplicateKey {
                            entity: "account",
                            key: account.id.to_string(),
                        });
                    }
                    account_versions.insert(account.id, account.version);
                }
                Write::UpdateAccount { account, expected } => {
                    let current = account_versions
                        .get(&account.id)
                        .copied()
                        .or_else(|| self.accounts.get(&account.id).map(|a| a.version));
                    if current != Some(*expected) {
                        return Err(StoreError::ConcurrencyConflict {
                            entity: "account",
                            id: account.id.to_string(),
                            expected: *expected,
                        });
                    }
                    account_versions.insert(account.id, account.version);
                }
                Write::InsertIdempotency(record) => {
                    let key = (record.tenant_id, record.id.clone());
                    if self.idempotency.contains_key(&key)
                        || !idempotency_keys.insert((record.tenant_id, &record.id))
                    {
                        return Err(StoreError::DuplicateKey {
                            entity: "idempotency record",
                            key: record.id.to_string(),
                        });
                    }
                }
                Write::CompleteIdempotency { tenant_id, id, .. } => {
                    if !self.idempotency.contains_key(&(*tenant_id, id.clone()))
                        && !idempotency_keys.contains(&(*tenant_id, id))
                    {
                        return Err(StoreError::NotFound {
                            entity: "idempotency record",
                            id: id.to_string(),
                        });
                    }
                }
                Write::InsertSaga(saga) => {
                    if self.sagas.contains_key(&saga.id) || saga_versions.contains_key(&saga.id) {
                        return Err(StoreError::DuplicateKey {
                            entity: "saga",
                            key: saga.id.to_string(),
                        });
                    }
                    saga_versions.insert(saga.id, saga.version);
                }
                Write::UpdateSaga { saga, expected } => {
                    let current = saga_versions
                        .get(&saga.id)
                        .copied()
                        .or_else(|| self.sagas.get(&saga.id).map(|s| s.version));
                    if current != Some(*expected) {
                        return Err(StoreError::ConcurrencyConflict {
                            entity: "saga",
                            id: saga.id.to_string(),
                            expected: *expected,
                        });
                    }
                    saga_versions.insert(saga.id, saga.version);
                }
                // Append-only collections with random ids never conflict.
                Write::AppendLedger(_) | Write::EnqueueOutbox(_) => {}
                Write::ReleaseIdempotency { tenant_id, id } => {
                    idempotency_keys.remove(&(*tenant_id, id));
                }
            }
        }

        Ok(())
    }

    fn apply(&mut self, write: Write) {
        match write {
            Write::InsertAccount(account) | Write::UpdateAccount { account, .. } => {
                self.accounts.insert(account.id, account);
            }
            Write::AppendLedger(event) => self.ledger.push(event),
            Write::EnqueueOutbox(message) => self.outbox.push(message),
            Write::InsertIdempotency(record) => {
                self.idempotency
                    .insert((record.tenant_id, record.id.clone()), record);
            }
            Write::CompleteIdempotency {
                tenant_id,
                id,
                success,
                result,
            } => {
                if let Some(record) = self.idempotency.get_mut(&(tenant_id, id)) {
                    record.success = success;
                    record.result = Some(result);
                    record.processed_at = Utc::now();
                }
            }
            Write::ReleaseIdempotency { tenant_id, id } => {
                let key = (tenant_id, id);
                if self.idempotency.get(&key).is_some_and(|r| !r.is_complete()) {
                    self.idempotency.remove(&key);
                }
            }
            Write::InsertSaga(saga) | Write::UpdateSaga { saga, .. } => {
                self.sagas.insert(saga.id, saga);
            }
        }
    }
}

/// In-memory store for tests and local development.
///
/// Atomic sessions stage their writes and re-validate every conditional
/// write and unique insert at commit, so concurrent sessions observe the same
/// conflicts a database would report. A store built with
/// [`InMemoryStore::without_transactions`] emulates an instance without
/// multi-statement transactions and hands out non-atomic sessions.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    supports_transactions: bool,
    degraded_warned: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store with transaction support.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            supports_transactions: true,
            degraded_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates an empty store that cannot run multi-statement transactions.
    pub fn without_transactions() -> Self {
        Self {
            supports_transactions: false,
            ..Self::new()
        }
    }

    /// Returns the total number of ledger events stored.
    pub async fn ledger_count(&self) -> usize {
        self.state.read().await.ledger.len()
    }

    /// Returns the total number of outbox messages stored.
    pub async fn outbox_count(&self) -> usize {
        self.state.read().await.outbox.len()
    }

    /// Returns every outbox message, processed or not.
    pub async fn all_outbox(&self) -> Vec<OutboxMessage> {
        self.state.read().await.outbox.clone()
    }

    /// Clears all collections.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = State::default();
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Session = InMemorySession;

    fn mode(&self) -> TransactionMode {
        if self.supports_transactions {
            TransactionMode::Atomic
        } else {
            TransactionMode::NonAtomic
        }
    }

    async fn begin(&self) -> Result<InMemorySession> {
        let mode = self.mode();
        if !mode.is_atomic() && !self.degraded_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "store does not support multi-statement transactions; sessions run non-atomically"
            );
        }
        Ok(InMemorySession {
            state: self.state.clone(),
            mode,
            pending: Vec::new(),
            acquired: HashSet::new(),
        })
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<AccountDocument>> {
        Ok(self.state.read().await.accounts.get(&id).cloned())
    }

    async fn ledger_for_account(&self, id: AccountId) -> Result<Vec<LedgerEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<_> = state
            .ledger
            .iter()
            .filter(|e| e.account_id == id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn ledger_for_correlation(&self, id: CorrelationId) -> Result<Vec<LedgerEvent>> {
        let state = self.state.read().await;
        let mut events: Vec<_> = state
            .ledger
            .iter()
            .filter(|e| e.correlation_id == id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn get_idempotency(
        &self,
        tenant_id: TenantId,
        id: &CommandId,
    ) -> Result<Option<IdempotencyRecord>> {
        let state = self.state.read().await;
        Ok(state.idempotency.get(&(tenant_id, id.clone())).cloned())
    }

    async fn get_saga(&self, id: SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.state.read().await.sagas.get(&id).cloned())
    }

    async fn sagas_by_status(
        &self,
        status: &str,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        let state = self.state.read().await;
        let mut sagas: Vec<_> = state
            .sagas
            .values()
            .filter(|s| s.status == status && s.updated_at < updated_before)
            .cloned()
            .collect();
        sagas.sort_by_key(|s| s.updated_at);
        sagas.truncate(limit);
        Ok(sagas)
    }

    async fn sagas_awaiting_compensation(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        let state = self.state.read().await;
        let mut sagas: Vec<_> = state
            .sagas
            .values()
            .filter(|s| s.status == "FAILED" && s.funds_locked && s.updated_at < updated_before)
            .cloned()
            .collect();
        sagas.sort_by_key(|s| s.updated_at);
        sagas.truncate(limit);
        Ok(sagas)
    }

    async fn pending_outbox(&self) -> Result<Vec<OutboxMessage>> {
        let state = self.state.read().await;
        let mut messages: Vec<_> = state
            .outbox
            .iter()
            .filter(|m| !m.processed)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let state = self.state.read().await;
        Ok(state.outbox.iter().find(|m| m.id == id).cloned())
    }

    async fn claim_outbox_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lock_expired_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let mut candidates: Vec<usize> = state
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_claimable(now, lock_expired_before))
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| state.outbox[i].created_at);
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for i in candidates {
            let message = &mut state.outbox[i];
            message.locked_by = Some(worker_id.to_string());
            message.locked_at = Some(now);
            claimed.push(message.clone());
        }
        Ok(claimed)
    }

    async fn mark_outbox_processed(&self, id: MessageId, worker_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(message) = state
            .outbox
            .iter_mut()
            .find(|m| m.id == id && !m.processed && m.locked_by.as_deref() == Some(worker_id))
        else {
            return Ok(false);
        };
        message.processed = true;
        message.processed_at = Some(Utc::now());
        Ok(true)
    }

    async fn release_outbox_lock(
        &self,
        id: MessageId,
        worker_id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(message) = state
            .outbox
            .iter_mut()
            .find(|m| m.id == id && !m.processed && m.locked_by.as_deref() == Some(worker_id))
        else {
            return Ok(false);
        };
        message.locked_by = None;
        message.locked_at = None;
        message.attempts += 1;
        message.next_attempt_at = next_attempt_at;
        message.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn stale_outbox_locks(
        &self,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .iter()
            .filter(|m| {
                !m.processed
                    && m.locked_by.is_some()
                    && m.locked_at.is_some_and(|at| at < locked_before)
            })
            .cloned()
            .collect())
    }
}

/// Unit of work over an [`InMemoryStore`].
pub struct InMemorySession {
    state: Arc<RwLock<State>>,
    mode: TransactionMode,
    pending: Vec<Write>,
    /// Idempotency keys this session inserted.
    acquired: HashSet<(TenantId, CommandId)>,
}

impl InMemorySession {
    async fn write(&mut self, write: Write) -> Result<()> {
        match self.mode {
            TransactionMode::Atomic => {
                let state = self.state.read().await;
                self.pending.push(write);
                if let Err(e) = state.validate(&self.pending) {
                    self.pending.pop();
                    return Err(e);
                }
                Ok(())
            }
            TransactionMode::NonAtomic => {
                let mut state = self.state.write().await;
                state.validate(std::slice::from_ref(&write))?;
                state.apply(write);
                Ok(())
            }
        }
    }

    fn overlay_account(
        &self,
        id: AccountId,
        committed: Option<AccountDocument>,
    ) -> Option<AccountDocument> {
        self.pending
            .iter()
            .fold(committed, |current, write| match write {
                Write::InsertAccount(account) | Write::UpdateAccount { account, .. }
                    if account.id == id =>
                {
                    Some(account.clone())
                }
                _ => current,
            })
    }

    fn overlay_saga(&self, id: SagaId, committed: Option<SagaRecord>) -> Option<SagaRecord> {
        self.pending
            .iter()
            .fold(committed, |current, write| match write {
                Write::InsertSaga(saga) | Write::UpdateSaga { saga, .. } if saga.id == id => {
                    Some(saga.clone())
                }
                _ => current,
            })
    }

    fn overlay_idempotency(
        &self,
        tenant_id: TenantId,
        id: &CommandId,
        committed: Option<IdempotencyRecord>,
    ) -> Option<IdempotencyRecord> {
        self.pending
            .iter()
            .fold(committed, |current, write| match write {
                Write::InsertIdempotency(record)
                    if record.tenant_id == tenant_id && &record.id == id =>
                {
                    Some(record.clone())
                }
                Write::ReleaseIdempotency {
                    tenant_id: released_tenant,
                    id: released,
                } if *released_tenant == tenant_id && released == id => {
                    current.filter(IdempotencyRecord::is_complete)
                }
                Write::CompleteIdempotency {
                    tenant_id: completed_tenant,
                    id: completed,
                    success,
                    result,
                } if *completed_tenant == tenant_id && completed == id => {
                    current.map(|mut record| {
                        record.success = *success;
                        record.result = Some(result.clone());
                        record
                    })
                }
                _ => current,
            })
    }
}

#[async_trait]
impl Session for InMemorySession {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    async fn load_account(&mut self, id: AccountId) -> Result<Option<AccountDocument>> {
        let committed = self.state.read().await.accounts.get(&id).cloned();
        Ok(self.overlay_account(id, committed))
    }

    async fn insert_account(&mut self, account: &AccountDocument) -> Result<()> {
        self.write(Write::InsertAccount(account.clone())).await
    }

    async fn update_account(
        &mut self,
        account: &AccountDocument,
        expected: Version,
    ) -> Result<u64> {
        let write = Write::UpdateAccount {
            account: account.clone(),
            expected,
        };
        match self.write(write).await {
            Ok(()) => Ok(1),
            Err(StoreError::ConcurrencyConflict { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn append_ledger(&mut self, event: &LedgerEvent) -> Result<()> {
        self.write(Write::AppendLedger(event.clone())).await
    }

    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        self.write(Write::EnqueueOutbox(message.clone())).await
    }

    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<bool> {
        match self.write(Write::InsertIdempotency(record.clone())).await {
            Ok(()) => {
                self.acquired.insert((record.tenant_id, record.id.clone()));
                Ok(true)
            }
            Err(StoreError::DuplicateKey { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_idempotency(
        &mut self,
        tenant_id: TenantId,
        id: &CommandId,
    ) -> Result<Option<IdempotencyRecord>> {
        let committed = self
            .state
            .read()
            .await
            .idempotency
            .get(&(tenant_id, id.clone()))
            .cloned();
        Ok(self.overlay_idempotency(tenant_id, id, committed))
    }

    async fn complete_idempotency(
        &mut self,
        tenant_id: TenantId,
        id: &CommandId,
        success: bool,
        result: &serde_json::Value,
    ) -> Result<()> {
        self.write(Write::CompleteIdempotency {
            tenant_id,
            id: id.clone(),
            success,
            result: result.clone(),
        })
        .await
    }

    async fn release_idempotency(&mut self, tenant_id: TenantId, id: &CommandId) -> Result<bool> {
        if !self.acquired.remove(&(tenant_id, id.clone())) {
            return Ok(false);
        }
        let held = self
            .get_idempotency(tenant_id, id)
            .await?
            .is_some_and(|r| !r.is_complete());
        if !held {
            return Ok(false);
        }
        self.write(Write::ReleaseIdempotency {
            tenant_id,
            id: id.clone(),
        })
        .await?;
        Ok(true)
    }

    async fn load_saga(&mut self, id: SagaId) -> Result<Option<SagaRecord>> {
        let committed = self.state.read().await.sagas.get(&id).cloned();
        Ok(self.overlay_saga(id, committed))
    }

    async fn insert_saga(&mut self, saga: &SagaRecord) -> Result<()> {
        self.write(Write::InsertSaga(saga.clone())).await
    }

    async fn update_saga(&mut self, saga: &SagaRecord, expected: Version) -> Result<u64> {
        let write = Write::UpdateSaga {
            saga: saga.clone(),
            expected,
        };
        match self.write(write).await {
            Ok(()) => Ok(1),
            Err(StoreError::ConcurrencyConflict { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn commit(self) -> Result<()> {
        if !self.mode.is_atomic() {
            return Ok(());
        }

        let mut state = self.state.write().await;
        state.validate(&self.pending)?;
        for write in self.pending {
            state.apply(write);
        }
        Ok(())
    }

    async fn abort(self) -> Result<()> {
        if self.mode.is_atomic() {
            tracing::debug!(discarded = self.pending.len(), "session aborted");
        } else {
            tracing::warn!("non-atomic session aborted; applied writes cannot be rolled back");
        }
        Ok(())
    }
}
