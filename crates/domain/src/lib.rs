//! Domain layer of the banking core.
//!
//! This crate provides:
//! - `Money` and `CurrencyCode` value types
//! - The `Account` aggregate and its optimistic-concurrency repository
//! - Ledger entry construction and balance replay
//! - The transactional outbox writer and the idempotency layer
//! - Regulatory packs resolved per tenant jurisdiction
//! - `AccountService`, the account command handlers

pub mod account;
pub mod commands;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod ledger;
pub mod money;
pub mod outbox;
pub mod regulatory;
pub mod repository;
pub mod service;

pub use account::{Account, AccountError};
pub use commands::{
    AccountOpened, BalanceChanged, Credit, Debit, OpenAccount, Transfer, TransferReceipt,
};
pub use error::{DomainError, Result};
pub use events::AccountEvent;
pub use idempotency::{CommandOutcome, LockOutcome};
pub use ledger::{LedgerEntry, LedgerEventType, replay_balances};
pub use money::{CurrencyCode, Money, MoneyError};
pub use outbox::topics;
pub use regulatory::{
    BrazilPack, Jurisdiction, OperationType, PermissivePack, RegulatoryPack, RegulatoryRegistry,
    TenantContext,
};
pub use service::AccountService;
