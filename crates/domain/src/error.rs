//! Domain error types.

use common::{AccountId, CommandId};
use store::StoreError;
use thiserror::Error;

use crate::account::AccountError;
use crate::money::MoneyError;

/// Errors returned by command handlers.
///
/// Callers decide between retrying and abandoning with
/// [`DomainError::is_retryable`].
#[derive(Debug, Error)]
pub enum DomainError {
    /// Malformed input rejected before any state was touched.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    /// The tenant's regulatory pack refused the operation.
    #[error("Regulatory rejection: {reason}")]
    RegulatoryRejection { reason: String },

    /// A conditional write lost the race against a concurrent writer.
    #[error("Concurrency conflict on {entity} {id}")]
    ConcurrencyConflict { entity: &'static str, id: String },

    /// The tenant already used this command id for a different operation.
    #[error("Command id {command_id} was already used for {recorded}, not {requested}")]
    CommandIdReused {
        command_id: CommandId,
        recorded: String,
        requested: &'static str,
    },

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Returns true when the same command may succeed if retried from a
    /// fresh read.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DomainError::ConcurrencyConflict { .. })
    }

    /// Returns true for an overdraft attempt.
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            DomainError::Account(AccountError::InsufficientFunds { .. })
        )
    }
}

impl From<StoreError> for DomainError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConcurrencyConflict { entity, id, .. } => {
                DomainError::ConcurrencyConflict { entity, id }
            }
            other => DomainError::Store(other),
        }
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use store::Version;

    use super::*;

    #[test]
    fn store_conflicts_become_retryable_domain_conflicts() {
        let err: DomainError = StoreError::ConcurrencyConflict {
            entity: "account",
            id: "a".to_string(),
            expected: Version::first(),
        }
        .into();
        assert!(err.is_retryable());
    }

    #[test]
    fn business_failures_are_not_retryable() {
        let err = DomainError::RegulatoryRejection {
            reason: "limit".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(!DomainError::AccountNotFound(AccountId::new()).is_retryable());
    }

    #[test]
    fn reused_command_id_names_both_operations() {
        let err = DomainError::CommandIdReused {
            command_id: CommandId::from("cmd-1"),
            recorded: "DEBIT".to_string(),
            requested: "TRANSFER",
        };
        assert!(!err.is_retryable());
        let message = err.to_string();
        assert!(message.contains("DEBIT"));
        assert!(message.contains("TRANSFER"));
    }
}
