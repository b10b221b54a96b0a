//! Pix saga state machine.

use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// Status of a Pix payment saga.
///
/// State transitions:
/// ```text
/// Created ──┬──► BalanceLocked ──┬──► Completed
///           │                    └──► Failed ──► Refunded
///           └──► Failed
/// ```
///
/// `Failed` is not terminal while the saga still holds the debited funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PixSagaStatus {
    /// Saga persisted, no money moved yet.
    #[default]
    Created,

    /// Source account debited; waiting on the settlement gateway.
    BalanceLocked,

    /// Gateway accepted the payment (terminal state).
    Completed,

    /// Debit or settlement was refused.
    Failed,

    /// Debited funds were credited back (terminal state).
    Refunded,
}

impl PixSagaStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [PixSagaStatus; 5] = [
        PixSagaStatus::Created,
        PixSagaStatus::BalanceLocked,
        PixSagaStatus::Completed,
        PixSagaStatus::Failed,
        PixSagaStatus::Refunded,
    ];

    /// Returns true if the source account can be debited.
    pub fn can_lock(&self) -> bool {
        matches!(self, PixSagaStatus::Created)
    }

    /// Returns true if the gateway may be called.
    pub fn can_settle(&self) -> bool {
        matches!(self, PixSagaStatus::BalanceLocked)
    }

    /// Returns true if `next` is a legal successor of this status.
    pub fn can_transition_to(&self, next: PixSagaStatus) -> bool {
        use PixSagaStatus::*;
        matches!(
            (self, next),
            (Created, BalanceLocked)
                | (Created, Failed)
                | (BalanceLocked, Completed)
                | (BalanceLocked, Failed)
                | (Failed, Refunded)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PixSagaStatus::Completed | PixSagaStatus::Refunded)
    }

    /// Returns the persisted status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixSagaStatus::Created => "CREATED",
            PixSagaStatus::BalanceLocked => "BALANCE_LOCKED",
            PixSagaStatus::Completed => "COMPLETED",
            PixSagaStatus::Failed => "FAILED",
            PixSagaStatus::Refunded => "REFUNDED",
        }
    }
}

impl std::fmt::Display for PixSagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PixSagaStatus {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PixSagaStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SagaError::UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_created() {
        assert_eq!(PixSagaStatus::default(), PixSagaStatus::Created);
    }

    #[test]
    fn test_transitions() {
        use PixSagaStatus::*;
        assert!(Created.can_transition_to(BalanceLocked));
        assert!(Created.can_transition_to(Failed));
        assert!(BalanceLocked.can_transition_to(Completed));
        assert!(BalanceLocked.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Refunded));

        assert!(!Created.can_transition_to(Completed));
        assert!(!Created.can_transition_to(Refunded));
        assert!(!BalanceLocked.can_transition_to(Refunded));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Refunded.can_transition_to(Created));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!PixSagaStatus::Created.is_terminal());
        assert!(!PixSagaStatus::BalanceLocked.is_terminal());
        assert!(!PixSagaStatus::Failed.is_terminal());
        assert!(PixSagaStatus::Completed.is_terminal());
        assert!(PixSagaStatus::Refunded.is_terminal());
    }

    #[test]
    fn test_persisted_names_parse_back() {
        for status in PixSagaStatus::ALL {
            assert_eq!(status.as_str().parse::<PixSagaStatus>().unwrap(), status);
        }
        assert!("PENDING".parse::<PixSagaStatus>().is_err());
    }
}
