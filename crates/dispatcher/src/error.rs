//! Dispatcher error types.

use store::StoreError;
use thiserror::Error;

/// Failure to hand a message to the broker or to one of its subscribers.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the message.
    #[error("Publish to '{topic}' rejected: {reason}")]
    Rejected { topic: String, reason: String },

    /// A subscriber failed to process the message.
    #[error("Subscriber failed: {0}")]
    Subscriber(String),
}

/// Errors that stop a dispatch cycle.
///
/// Publish failures are not among them: they are handled per message by
/// releasing its lock.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
