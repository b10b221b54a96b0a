use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AccountDocument, AccountId, CommandId, CorrelationId, IdempotencyRecord, LedgerEvent,
    LedgerEventId, MessageId, OutboxMessage, Result, SagaId, SagaRecord, StoreError, TenantId,
    Version,
    store::{Session, Store, TransactionMode},
};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    mode: TransactionMode,
}

impl PostgresStore {
    /// Creates a store whose sessions run inside database transactions.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            mode: TransactionMode::Atomic,
        }
    }

    /// Creates a store whose sessions issue every statement directly on a
    /// pooled connection, for deployments where transactions are unavailable.
    pub fn non_atomic(pool: PgPool) -> Self {
        tracing::warn!("postgres store running without transactions; sessions are non-atomic");
        Self {
            pool,
            mode: TransactionMode::NonAtomic,
        }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn balances_to_json(balances: &BTreeMap<String, Decimal>) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(balances)?)
}

fn row_to_account(row: PgRow) -> Result<AccountDocument> {
    let balances_json: serde_json::Value = row.try_get("balances")?;
    let balances: BTreeMap<String, Decimal> = serde_json::from_value(balances_json)?;

    Ok(AccountDocument {
        id: AccountId::from_uuid(row.try_get::<Uuid, _>("id")?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
        balances,
        version: Version::new(row.try_get("version")?),
        last_updated: row.try_get("last_updated")?,
    })
}

fn row_to_ledger_event(row: PgRow) -> Result<LedgerEvent> {
    let currency_code: String = row.try_get("currency_code")?;
    Ok(LedgerEvent {
        id: LedgerEventId::from_uuid(row.try_get::<Uuid, _>("id")?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
        account_id: AccountId::from_uuid(row.try_get::<Uuid, _>("account_id")?),
        event_type: row.try_get("event_type")?,
        amount: row.try_get("amount")?,
        currency_code: currency_code.trim().to_string(),
        balance_after: row.try_get("balance_after")?,
        correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
        timestamp: row.try_get("timestamp")?,
        metadata: row.try_get("metadata")?,
    })
}

fn row_to_outbox(row: PgRow) -> Result<OutboxMessage> {
    Ok(OutboxMessage {
        id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        processed: row.try_get("processed")?,
        processed_at: row.try_get("processed_at")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn row_to_idempotency(row: PgRow) -> Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
        id: CommandId::new(row.try_get::<String, _>("id")?),
        processed_at: row.try_get("processed_at")?,
        operation_type: row.try_get("operation_type")?,
        success: row.try_get("success")?,
        result: row.try_get("result")?,
    })
}

fn row_to_saga(row: PgRow) -> Result<SagaRecord> {
    let currency_code: String = row.try_get("currency_code")?;
    Ok(SagaRecord {
        id: SagaId::from_uuid(row.try_get::<Uuid, _>("id")?),
        tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
        account_id: AccountId::from_uuid(row.try_get::<Uuid, _>("account_id")?),
        amount: row.try_get("amount")?,
        tax: row.try_get("tax")?,
        currency_code: currency_code.trim().to_string(),
        pix_key: row.try_get("pix_key")?,
        status: row.try_get("status")?,
        failure_reason: row.try_get("failure_reason")?,
        funds_locked: row.try_get("funds_locked")?,
        settlement_id: row.try_get("settlement_id")?,
        version: Version::new(row.try_get("version")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    type Session = PostgresSession;

    fn mode(&self) -> TransactionMode {
        self.mode
    }

    async fn begin(&self) -> Result<PostgresSession> {
        let conn = match self.mode {
            TransactionMode::Atomic => Connection::Transaction(self.pool.begin().await?),
            TransactionMode::NonAtomic => Connection::Direct(self.pool.acquire().await?),
        };
        Ok(PostgresSession {
            conn,
            mode: self.mode,
            acquired: HashSet::new(),
        })
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<AccountDocument>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, balances, version, last_updated
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_account).transpose()
    }

    async fn ledger_for_account(&self, id: AccountId) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, account_id, event_type, amount, currency_code, balance_after,
                   correlation_id, timestamp, metadata
            FROM ledger
            WHERE account_id = $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_ledger_event).collect()
    }

    async fn ledger_for_correlation(&self, id: CorrelationId) -> Result<Vec<LedgerEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, account_id, event_type, amount, currency_code, balance_after,
                   correlation_id, timestamp, metadata
            FROM ledger
            WHERE correlation_id = $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_ledger_event).collect()
    }

    async fn get_idempotency(
        &self,
        tenant_id: TenantId,
        id: &CommandId,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, id, processed_at, operation_type, success, result
            FROM idempotency_records
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_idempotency).transpose()
    }

    async fn get_saga(&self, id: SagaId) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, account_id, amount, tax, currency_code, pix_key, status,
                   failure_reason, funds_locked, settlement_id, version, created_at, updated_at
            FROM sagas
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_saga).transpose()
    }

    async fn sagas_by_status(
        &self,
        status: &str,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, account_id, amount, tax, currency_code, pix_key, status,
                   failure_reason, funds_locked, settlement_id, version, created_at, updated_at
            FROM sagas
            WHERE status = $1 AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
        )
        .bind(status)
        .bind(updated_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_saga).collect()
    }

    async fn sagas_awaiting_compensation(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, account_id, amount, tax, currency_code, pix_key, status,
                   failure_reason, funds_locked, settlement_id, version, created_at, updated_at
            FROM sagas
            WHERE status = 'FAILED' AND funds_locked = TRUE AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(updated_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_saga).collect()
    }

    async fn pending_outbox(&self) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, topic, payload, created_at, processed, processed_at,
                   locked_by, locked_at, attempts, next_attempt_at, last_error
            FROM outbox
            WHERE processed = FALSE
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_outbox).collect()
    }

    async fn get_outbox_message(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, topic, payload, created_at, processed, processed_at,
                   locked_by, locked_at, attempts, next_attempt_at, last_error
            FROM outbox
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_outbox).transpose()
    }

    async fn claim_outbox_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lock_expired_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>> {
        // SKIP LOCKED keeps concurrent dispatchers from claiming the same rows.
        let rows = sqlx::query(
            r#"
            UPDATE outbox SET locked_by = $1, locked_at = $2
            WHERE id IN (
                SELECT id FROM outbox
                WHERE processed = FALSE
                  AND next_attempt_at <= $2
                  AND (locked_by IS NULL OR locked_at < $3)
                ORDER BY created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, tenant_id, topic, payload, created_at, processed, processed_at,
                      locked_by, locked_at, attempts, next_attempt_at, last_error
            "#,
        )
        .bind(worker_id)
        .bind(Utc::now())
        .bind(lock_expired_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(row_to_outbox)
            .collect::<Result<Vec<_>>>()?;
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn mark_outbox_processed(&self, id: MessageId, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox SET processed = TRUE, processed_at = $3
            WHERE id = $1 AND locked_by = $2 AND processed = FALSE
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_outbox_lock(
        &self,
        id: MessageId,
        worker_id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET locked_by = NULL, locked_at = NULL, attempts = attempts + 1,
                next_attempt_at = $3, last_error = $4
            WHERE id = $1 AND locked_by = $2 AND processed = FALSE
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn stale_outbox_locks(
        &self,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, topic, payload, created_at, processed, processed_at,
                   locked_by, locked_at, attempts, next_attempt_at, last_error
            FROM outbox
            WHERE processed = FALSE AND locked_by IS NOT NULL AND locked_at < $1
            ORDER BY locked_at ASC
            "#,
        )
        .bind(locked_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_outbox).collect()
    }
}

enum Connection {
    Transaction(Transaction<'static, Postgres>),
    Direct(PoolConnection<Postgres>),
}

impl Connection {
    fn executor(&mut self) -> &mut PgConnection {
        match self {
            Connection::Transaction(tx) => &mut **tx,
            Connection::Direct(conn) => &mut **conn,
        }
    }
}

/// Unit of work over a [`PostgresStore`].
pub struct PostgresSession {
    conn: Connection,
    mode: TransactionMode,
    /// Idempotency keys this session inserted.
    acquired: HashSet<(TenantId, CommandId)>,
}

#[async_trait]
impl Session for PostgresSession {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    async fn load_account(&mut self, id: AccountId) -> Result<Option<AccountDocument>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, balances, version, last_updated
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.conn.executor())
        .await?;

        row.map(row_to_account).transpose()
    }

    async fn insert_account(&mut self, account: &AccountDocument) -> Result<()> {
        let balances = balances_to_json(&account.balances)?;
        sqlx::query(
            r#"
            INSERT INTO accounts (id, tenant_id, balances, version, last_updated)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(account.tenant_id.as_uuid())
        .bind(balances)
        .bind(account.version.as_i64())
        .bind(account.last_updated)
        .execute(self.conn.executor())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StoreError::DuplicateKey {
                    entity: "account",
                    key: account.id.to_string(),
                };
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn update_account(
        &mut self,
        account: &AccountDocument,
        expected: Version,
    ) -> Result<u64> {
        let balances = balances_to_json(&account.balances)?;
        let result = sqlx::query(
            r#"
            UPDATE accounts SET balances = $3, version = $4, last_updated = $5
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(expected.as_i64())
        .bind(balances)
        .bind(account.version.as_i64())
        .bind(account.last_updated)
        .execute(self.conn.executor())
        .await?;

        Ok(result.rows_affected())
    }

    async fn append_ledger(&mut self, event: &LedgerEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger (id, tenant_id, account_id, event_type, amount, currency_code,
                                balance_after, correlation_id, timestamp, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.tenant_id.as_uuid())
        .bind(event.account_id.as_uuid())
        .bind(&event.event_type)
        .bind(event.amount)
        .bind(&event.currency_code)
        .bind(event.balance_after)
        .bind(event.correlation_id.as_uuid())
        .bind(event.timestamp)
        .bind(&event.metadata)
        .execute(self.conn.executor())
        .await?;

        Ok(())
    }

    async fn enqueue_outbox(&mut self, message: &OutboxMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox (id, tenant_id, topic, payload, created_at, processed, processed_at,
                                locked_by, locked_at, attempts, next_attempt_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.tenant_id.as_uuid())
        .bind(&message.topic)
        .bind(&message.payload)
        .bind(message.created_at)
        .bind(message.processed)
        .bind(message.processed_at)
        .bind(&message.locked_by)
        .bind(message.locked_at)
        .bind(message.attempts)
        .bind(message.next_attempt_at)
        .bind(&message.last_error)
        .execute(self.conn.executor())
        .await?;

        Ok(())
    }

    async fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<bool> {
        // ON CONFLICT keeps the transaction usable when the key already exists.
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records
                (tenant_id, id, processed_at, operation_type, success, result)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, id) DO NOTHING
            "#,
        )
        .bind(record.tenant_id.as_uuid())
        .bind(record.id.as_str())
        .bind(record.processed_at)
        .bind(&record.operation_type)
        .bind(record.success)
        .bind(&record.result)
        .execute(self.conn.executor())
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            self.acquired.insert((record.tenant_id, record.id.clone()));
        }
        Ok(inserted)
    }

    async fn get_idempotency(
        &mut self,
        tenant_id: TenantId,
        id: &CommandId,
    ) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, id, processed_at, operation_type, success, result
            FROM idempotency_records
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_str())
        .fetch_optional(self.conn.executor())
        .await?;

        row.map(row_to_idempotency).transpose()
    }

    async fn complete_idempotency(
        &mut self,
        tenant_id: TenantId,
        id: &CommandId,
        success: bool,
        result: &serde_json::Value,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_records SET success = $3, result = $4, processed_at = $5
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_str())
        .bind(success)
        .bind(result)
        .bind(Utc::now())
        .execute(self.conn.executor())
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "idempotency record",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn release_idempotency(&mut self, tenant_id: TenantId, id: &CommandId) -> Result<bool> {
        if !self.acquired.remove(&(tenant_id, id.clone())) {
            return Ok(false);
        }
        let deleted = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE tenant_id = $1 AND id = $2 AND result IS NULL
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_str())
        .execute(self.conn.executor())
        .await?;

        Ok(deleted.rows_affected() == 1)
    }

    async fn load_saga(&mut self, id: SagaId) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, account_id, amount, tax, currency_code, pix_key, status,
                   failure_reason, funds_locked, settlement_id, version, created_at, updated_at
            FROM sagas
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.conn.executor())
        .await?;

        row.map(row_to_saga).transpose()
    }

    async fn insert_saga(&mut self, saga: &SagaRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sagas (id, tenant_id, account_id, amount, tax, currency_code, pix_key,
                               status, failure_reason, funds_locked, settlement_id, version,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(saga.tenant_id.as_uuid())
        .bind(saga.account_id.as_uuid())
        .bind(saga.amount)
        .bind(saga.tax)
        .bind(&saga.currency_code)
        .bind(&saga.pix_key)
        .bind(&saga.status)
        .bind(&saga.failure_reason)
        .bind(saga.funds_locked)
        .bind(&saga.settlement_id)
        .bind(saga.version.as_i64())
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(self.conn.executor())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StoreError::DuplicateKey {
                    entity: "saga",
                    key: saga.id.to_string(),
                };
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn update_saga(&mut self, saga: &SagaRecord, expected: Version) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sagas
            SET status = $3, failure_reason = $4, funds_locked = $5, settlement_id = $6,
                version = $7, updated_at = $8
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(expected.as_i64())
        .bind(&saga.status)
        .bind(&saga.failure_reason)
        .bind(saga.funds_locked)
        .bind(&saga.settlement_id)
        .bind(saga.version.as_i64())
        .bind(saga.updated_at)
        .execute(self.conn.executor())
        .await?;

        Ok(result.rows_affected())
    }

    async fn commit(self) -> Result<()> {
        match self.conn {
            Connection::Transaction(tx) => tx.commit().await?,
            Connection::Direct(_) => {}
        }
        Ok(())
    }

    async fn abort(self) -> Result<()> {
        match self.conn {
            Connection::Transaction(tx) => tx.rollback().await?,
            Connection::Direct(_) => {
                tracing::warn!("non-atomic session aborted; applied writes cannot be rolled back");
            }
        }
        Ok(())
    }
}
