//! Account commands and their receipts.
//!
//! Every command carries the client-supplied [`CommandId`] used for
//! deduplication. Receipts are stored as the idempotent result, so a retried
//! command gets back exactly what the first execution returned.

use common::{AccountId, CommandId, CorrelationId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use store::Version;

use crate::money::Money;

/// Command to open a new account.
#[derive(Debug, Clone)]
pub struct OpenAccount {
    pub command_id: CommandId,
    pub account_id: AccountId,
}

impl OpenAccount {
    pub fn new(command_id: impl Into<CommandId>) -> Self {
        Self {
            command_id: command_id.into(),
            account_id: AccountId::new(),
        }
    }
}

/// Command to deposit money.
#[derive(Debug, Clone)]
pub struct Credit {
    pub command_id: CommandId,
    pub account_id: AccountId,
    pub amount: Money,
}

impl Credit {
    pub fn new(command_id: impl Into<CommandId>, account_id: AccountId, amount: Money) -> Self {
        Self {
            command_id: command_id.into(),
            account_id,
            amount,
        }
    }
}

/// Command to withdraw money. Tax is charged on top of `amount`.
#[derive(Debug, Clone)]
pub struct Debit {
    pub command_id: CommandId,
    pub account_id: AccountId,
    pub amount: Money,
}

impl Debit {
    pub fn new(command_id: impl Into<CommandId>, account_id: AccountId, amount: Money) -> Self {
        Self {
            command_id: command_id.into(),
            account_id,
            amount,
        }
    }
}

/// Command to move money between two accounts of the same tenant.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub command_id: CommandId,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Money,
}

impl Transfer {
    pub fn new(
        command_id: impl Into<CommandId>,
        from: AccountId,
        to: AccountId,
        amount: Money,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            from,
            to,
            amount,
        }
    }
}

/// Result of [`OpenAccount`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountOpened {
    pub account_id: AccountId,
    pub version: Version,
}

/// Result of [`Credit`] and [`Debit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceChanged {
    pub account_id: AccountId,
    pub correlation_id: CorrelationId,
    /// Total moved, tax included.
    pub amount: Money,
    pub tax: Decimal,
    pub balance_after: Money,
    pub version: Version,
}

/// Result of [`Transfer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub correlation_id: CorrelationId,
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Money,
    pub from_balance_after: Money,
    pub to_balance_after: Money,
}
