//! Persisted record types, one per logical collection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    AccountId, CommandId, CorrelationId, LedgerEventId, MessageId, SagaId, TenantId, Version,
};

/// Stored form of an account: per-currency balances plus the version token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountDocument {
    pub id: AccountId,
    pub tenant_id: TenantId,
    /// Balance amounts keyed by ISO-4217 currency code.
    pub balances: BTreeMap<String, Decimal>,
    pub version: Version,
    pub last_updated: DateTime<Utc>,
}

/// One append-only balance change.
///
/// Ledger events are never updated or deleted. Events produced by the same
/// logical operation share a `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: LedgerEventId,
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    /// E.g. `DEBIT`, `CREDIT`, `TRANSFER_SENT`, `TRANSFER_RECEIVED`, `REFUND`.
    pub event_type: String,
    pub amount: Decimal,
    pub currency_code: String,
    pub balance_after: Decimal,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// A message staged for publication to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub topic: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub attempts: i32,
    /// The message is not claimable before this instant.
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl OutboxMessage {
    /// Creates an unprocessed, unlocked message that is immediately claimable.
    pub fn new(tenant_id: TenantId, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId::new(),
            tenant_id,
            topic: topic.into(),
            payload,
            created_at: now,
            processed: false,
            processed_at: None,
            locked_by: None,
            locked_at: None,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
        }
    }

    /// Returns true if the message can be claimed at `now` by a dispatcher,
    /// treating locks taken before `lock_expired_before` as abandoned.
    pub fn is_claimable(&self, now: DateTime<Utc>, lock_expired_before: DateTime<Utc>) -> bool {
        if self.processed || self.next_attempt_at > now {
            return false;
        }
        match self.locked_at {
            Some(locked_at) if self.locked_by.is_some() => locked_at < lock_expired_before,
            _ => true,
        }
    }
}

/// Deduplication record for a client-submitted command.
///
/// Keyed by `(tenant_id, id)`: command ids are chosen by clients and only
/// unique within a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tenant_id: TenantId,
    pub id: CommandId,
    pub processed_at: DateTime<Utc>,
    pub operation_type: String,
    pub success: bool,
    /// Serialized command result; `None` while the command is in flight.
    pub result: Option<serde_json::Value>,
}

impl IdempotencyRecord {
    /// Creates the in-flight marker inserted when a command takes its lock.
    pub fn in_progress(
        tenant_id: TenantId,
        id: CommandId,
        operation_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            id,
            processed_at: Utc::now(),
            operation_type: operation_type.into(),
            success: false,
            result: None,
        }
    }

    /// Returns true once a final result has been recorded.
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

/// Stored form of a Pix payment saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub id: SagaId,
    pub tenant_id: TenantId,
    pub account_id: AccountId,
    pub amount: Decimal,
    /// Tax charged on top of `amount` when the funds are locked.
    pub tax: Decimal,
    pub currency_code: String,
    pub pix_key: String,
    pub status: String,
    pub failure_reason: Option<String>,
    /// True while the source account holds a debit this saga must settle or refund.
    pub funds_locked: bool,
    pub settlement_id: Option<String>,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
