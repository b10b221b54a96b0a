//! Identifier types shared by every crate of the banking core.

mod types;

pub use types::{
    AccountId, CommandId, CorrelationId, LedgerEventId, MessageId, SagaId, TenantId,
};
