//! Account events published through the outbox.

use common::{AccountId, CorrelationId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// Payloads of the `account-events` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AccountEvent {
    AccountOpened {
        account_id: AccountId,
    },
    BalanceCredited {
        account_id: AccountId,
        correlation_id: CorrelationId,
        amount: Money,
        balance_after: Money,
    },
    BalanceDebited {
        account_id: AccountId,
        correlation_id: CorrelationId,
        amount: Money,
        tax: Decimal,
        balance_after: Money,
    },
    TransferCompleted {
        correlation_id: CorrelationId,
        from: AccountId,
        to: AccountId,
        amount: Money,
    },
}

impl AccountEvent {
    /// Returns the `type` tag written to the payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened { .. } => "account-opened",
            AccountEvent::BalanceCredited { .. } => "balance-credited",
            AccountEvent::BalanceDebited { .. } => "balance-debited",
            AccountEvent::TransferCompleted { .. } => "transfer-completed",
        }
    }
}
