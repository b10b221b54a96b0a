//! Append-only ledger of balance changes.

use std::collections::BTreeMap;

use chrono::Utc;
use common::{CorrelationId, LedgerEventId};
use serde::{Deserialize, Serialize};
use store::{LedgerEvent, Session};

use crate::account::Account;
use crate::error::{DomainError, Result};
use crate::money::{CurrencyCode, Money};

/// Kind of balance change recorded by a ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEventType {
    Debit,
    Credit,
    TransferSent,
    TransferReceived,
    Refund,
}

impl LedgerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventType::Debit => "DEBIT",
            LedgerEventType::Credit => "CREDIT",
            LedgerEventType::TransferSent => "TRANSFER_SENT",
            LedgerEventType::TransferReceived => "TRANSFER_RECEIVED",
            LedgerEventType::Refund => "REFUND",
        }
    }

    /// Returns true for event types that take money out of the account.
    pub fn is_outflow(&self) -> bool {
        matches!(self, LedgerEventType::Debit | LedgerEventType::TransferSent)
    }
}

impl std::fmt::Display for LedgerEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerEventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEBIT" => Ok(LedgerEventType::Debit),
            "CREDIT" => Ok(LedgerEventType::Credit),
            "TRANSFER_SENT" => Ok(LedgerEventType::TransferSent),
            "TRANSFER_RECEIVED" => Ok(LedgerEventType::TransferReceived),
            "REFUND" => Ok(LedgerEventType::Refund),
            other => Err(DomainError::Validation(format!(
                "unknown ledger event type {other:?}"
            ))),
        }
    }
}

/// A ledger event under construction.
///
/// Built right after the account mutation so that `balance_after` reflects
/// the mutated balance.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    event_type: LedgerEventType,
    amount: Money,
    correlation_id: CorrelationId,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl LedgerEntry {
    pub fn new(event_type: LedgerEventType, amount: Money, correlation_id: CorrelationId) -> Self {
        Self {
            event_type,
            amount,
            correlation_id,
            metadata: serde_json::Map::new(),
        }
    }

    /// Attaches a metadata field.
    pub fn metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Produces the record for `account` in its current (mutated) state.
    pub fn build(self, account: &Account) -> LedgerEvent {
        let currency = self.amount.currency();
        LedgerEvent {
            id: LedgerEventId::new(),
            tenant_id: account.tenant_id(),
            account_id: account.id(),
            event_type: self.event_type.as_str().to_string(),
            amount: self.amount.amount(),
            currency_code: currency.as_str().to_string(),
            balance_after: account.balance_or_zero(currency).amount(),
            correlation_id: self.correlation_id,
            timestamp: Utc::now(),
            metadata: serde_json::Value::Object(self.metadata),
        }
    }
}

/// Appends the entry for `account` inside `session`.
pub async fn append<S: Session>(
    session: &mut S,
    account: &Account,
    entry: LedgerEntry,
) -> Result<LedgerEvent> {
    let event = entry.build(account);
    session.append_ledger(&event).await?;
    Ok(event)
}

/// Rebuilds per-currency balances from an account's ledger history.
///
/// Outflows subtract, every other event type adds.
pub fn replay_balances(events: &[LedgerEvent]) -> Result<BTreeMap<CurrencyCode, Money>> {
    let mut balances: BTreeMap<CurrencyCode, Money> = BTreeMap::new();

    for event in events {
        let event_type: LedgerEventType = event.event_type.parse()?;
        let currency = CurrencyCode::parse(&event.currency_code)?;
        let amount = Money::of(event.amount, currency);
        let current = balances
            .get(&currency)
            .copied()
            .unwrap_or_else(|| Money::zero(currency));

        let updated = if event_type.is_outflow() {
            current.subtract(&amount)?
        } else {
            current.add(&amount)?
        };
        balances.insert(currency, updated);
    }

    Ok(balances)
}

#[cfg(test)]
mod tests {
    use common::{AccountId, TenantId};
    use rust_decimal::Decimal;

    use super::*;

    fn brl(amount: i64) -> Money {
        Money::of(Decimal::from(amount), CurrencyCode::BRL)
    }

    #[test]
    fn event_type_strings_round_trip() {
        for ty in [
            LedgerEventType::Debit,
            LedgerEventType::Credit,
            LedgerEventType::TransferSent,
            LedgerEventType::TransferReceived,
            LedgerEventType::Refund,
        ] {
            assert_eq!(ty.as_str().parse::<LedgerEventType>().unwrap(), ty);
        }
        assert!("WITHDRAW".parse::<LedgerEventType>().is_err());
    }

    #[test]
    fn entry_records_balance_after_and_metadata() {
        let mut account = Account::open(AccountId::new(), TenantId::new());
        account.credit(&brl(100)).unwrap();
        account.debit(&brl(40)).unwrap();

        let correlation_id = CorrelationId::new();
        let event = LedgerEntry::new(LedgerEventType::Debit, brl(40), correlation_id)
            .metadata("tax", "0")
            .build(&account);

        assert_eq!(event.event_type, "DEBIT");
        assert_eq!(event.amount, Decimal::from(40));
        assert_eq!(event.balance_after, Decimal::from(60));
        assert_eq!(event.correlation_id, correlation_id);
        assert_eq!(event.metadata["tax"], "0");
    }

    #[test]
    fn replay_reconstructs_balances() {
        let mut account = Account::open(AccountId::new(), TenantId::new());
        let mut events = Vec::new();
        let steps = [
            (LedgerEventType::Credit, 100),
            (LedgerEventType::Debit, 40),
            (LedgerEventType::TransferReceived, 15),
            (LedgerEventType::TransferSent, 25),
            (LedgerEventType::Refund, 40),
        ];
        for (ty, amount) in steps {
            if ty.is_outflow() {
                account.debit(&brl(amount)).unwrap();
            } else {
                account.credit(&brl(amount)).unwrap();
            }
            events.push(LedgerEntry::new(ty, brl(amount), CorrelationId::new()).build(&account));
        }

        let balances = replay_balances(&events).unwrap();
        assert_eq!(balances[&CurrencyCode::BRL], brl(90));
        assert_eq!(
            Some(&balances[&CurrencyCode::BRL]),
            account.balance(&CurrencyCode::BRL)
        );
    }
}
