//! Saga events published on the `pix-saga` topic.

use common::{AccountId, SagaId};
use domain::Money;
use serde::{Deserialize, Serialize};

/// Payloads of the `pix-saga` topic. Each one names the saga it belongs to;
/// consumers reload the saga rather than trusting the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PixSagaEvent {
    SagaCreated {
        saga_id: SagaId,
        account_id: AccountId,
        amount: Money,
        pix_key: String,
    },
    SagaLocked {
        saga_id: SagaId,
        account_id: AccountId,
        debited: Money,
    },
    SagaCompleted {
        saga_id: SagaId,
        settlement_id: String,
    },
    SagaFailed {
        saga_id: SagaId,
        reason: String,
    },
    SagaRefunded {
        saga_id: SagaId,
        account_id: AccountId,
        refunded: Money,
    },
}

impl PixSagaEvent {
    pub fn saga_id(&self) -> SagaId {
        match self {
            PixSagaEvent::SagaCreated { saga_id, .. }
            | PixSagaEvent::SagaLocked { saga_id, .. }
            | PixSagaEvent::SagaCompleted { saga_id, .. }
            | PixSagaEvent::SagaFailed { saga_id, .. }
            | PixSagaEvent::SagaRefunded { saga_id, .. } => *saga_id,
        }
    }

    /// Returns the `type` tag written to the payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            PixSagaEvent::SagaCreated { .. } => "saga-created",
            PixSagaEvent::SagaLocked { .. } => "saga-locked",
            PixSagaEvent::SagaCompleted { .. } => "saga-completed",
            PixSagaEvent::SagaFailed { .. } => "saga-failed",
            PixSagaEvent::SagaRefunded { .. } => "saga-refunded",
        }
    }
}
