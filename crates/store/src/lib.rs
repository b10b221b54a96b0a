//! Persistence layer for the banking core.
//!
//! Every money-moving command runs inside a [`Session`] (the unit of work)
//! opened from a [`Store`]. A session routes all reads and writes through one
//! atomic transaction, or, when the backing instance cannot run
//! multi-statement transactions, through a degraded non-atomic session.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod records;
pub mod store;
pub mod version;

pub use common::{AccountId, CommandId, CorrelationId, LedgerEventId, MessageId, SagaId, TenantId};
pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use records::{AccountDocument, IdempotencyRecord, LedgerEvent, OutboxMessage, SagaRecord};
pub use store::{Session, Store, TransactionMode};
pub use version::Version;
