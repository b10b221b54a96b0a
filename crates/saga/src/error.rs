//! Saga error types.

use std::time::Duration;

use common::SagaId;
use domain::{DomainError, MoneyError};
use store::StoreError;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::state::PixSagaStatus;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No saga with this id exists.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// The requested transition is not allowed from the current status.
    #[error("Invalid saga transition: {from} -> {to}")]
    InvalidTransition {
        from: PixSagaStatus,
        to: PixSagaStatus,
    },

    /// A persisted status name is not recognized.
    #[error("Unknown saga status: {0}")]
    UnknownStatus(String),

    /// The gateway call failed for a technical reason.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The gateway did not answer in time.
    #[error("Gateway call timed out after {0:?}")]
    GatewayTimeout(Duration),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Technical failures and lost races leave the saga where it was; a
    /// later attempt from the persisted state may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::Gateway(_) | SagaError::GatewayTimeout(_) => true,
            SagaError::Domain(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for SagaError {
    fn from(e: StoreError) -> Self {
        SagaError::Domain(e.into())
    }
}

impl From<MoneyError> for SagaError {
    fn from(e: MoneyError) -> Self {
        SagaError::Domain(e.into())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
