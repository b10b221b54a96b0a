//! Outbox dispatcher for the banking core.
//!
//! Moves committed outbox messages to the message broker:
//! - Claim: lock a batch under this worker's identity
//! - Publish: hand each message to the broker, a bounded number at a time
//! - Settle: mark successes processed, release failures with backoff
//!
//! Messages are never dropped; repeated failures are surfaced through logs,
//! the poison counter and lock-age monitoring.

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod retry;

pub use broker::{InMemoryBroker, MessageBroker, Subscriber};
pub use config::DispatcherConfig;
pub use dispatcher::{DispatchReport, OutboxDispatcher};
pub use error::{BrokerError, DispatchError, Result};
pub use retry::RetryPolicy;
