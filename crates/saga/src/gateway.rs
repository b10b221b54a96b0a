//! Settlement gateway contract and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::SagaId;
use domain::Money;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A payment handed to the external rail.
///
/// `saga_id` is the idempotency key: resending the same saga must not move
/// money twice on the rail.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRequest {
    pub saga_id: SagaId,
    pub pix_key: String,
    pub amount: Money,
}

/// Conclusive answer of the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementOutcome {
    /// The rail settled the payment.
    Accepted { transaction_id: String },
    /// The rail refused the payment. Funds must be returned.
    Rejected { error_code: String },
}

/// Inconclusive failure of a gateway call.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

/// The external settlement network.
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Sends a payment. Technical failures are errors; refusals are
    /// [`SettlementOutcome::Rejected`].
    async fn send(&self, request: &SettlementRequest) -> Result<SettlementOutcome, GatewayError>;
}

/// How the in-memory gateway answers the next calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum GatewayBehavior {
    #[default]
    Accept,
    Reject(String),
    Fail(String),
}

#[derive(Debug, Default)]
struct InMemoryGatewayState {
    behavior: GatewayBehavior,
    delay: Option<Duration>,
    settled: HashMap<SagaId, SettlementOutcome>,
    calls: usize,
    next_id: u32,
}

/// In-memory gateway for tests and local runs.
///
/// Conclusive outcomes are remembered per saga id and returned again on a
/// resend.
#[derive(Debug, Clone, Default)]
pub struct InMemorySettlementGateway {
    state: Arc<Mutex<InMemoryGatewayState>>,
}

impl InMemorySettlementGateway {
    /// Creates a gateway that accepts every payment.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryGatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the answer to subsequent calls.
    pub fn set_behavior(&self, behavior: GatewayBehavior) {
        self.state().behavior = behavior;
    }

    /// Delays every answer, e.g. to exceed the caller's timeout.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Number of calls received, resends included.
    pub fn call_count(&self) -> usize {
        self.state().calls
    }

    /// Recorded outcome for a saga, if any.
    pub fn outcome_for(&self, saga_id: SagaId) -> Option<SettlementOutcome> {
        self.state().settled.get(&saga_id).cloned()
    }
}

#[async_trait]
impl SettlementGateway for InMemorySettlementGateway {
    async fn send(&self, request: &SettlementRequest) -> Result<SettlementOutcome, GatewayError> {
        let delay = {
            let mut state = self.state();
            state.calls += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(outcome) = state.settled.get(&request.saga_id) {
            return Ok(outcome.clone());
        }

        let outcome = match state.behavior.clone() {
            GatewayBehavior::Accept => {
                state.next_id += 1;
                SettlementOutcome::Accepted {
                    transaction_id: format!("E2E-{:06}", state.next_id),
                }
            }
            GatewayBehavior::Reject(error_code) => SettlementOutcome::Rejected { error_code },
            GatewayBehavior::Fail(reason) => return Err(GatewayError::Unavailable(reason)),
        };
        state.settled.insert(request.saga_id, outcome.clone());
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use domain::CurrencyCode;
    use rust_decimal::Decimal;

    use super::*;

    fn request() -> SettlementRequest {
        SettlementRequest {
            saga_id: SagaId::new(),
            pix_key: "alice@example.com".to_string(),
            amount: Money::of(Decimal::from(20), CurrencyCode::BRL),
        }
    }

    #[tokio::test]
    async fn resend_returns_recorded_outcome() {
        let gateway = InMemorySettlementGateway::new();
        let request = request();

        let first = gateway.send(&request).await.unwrap();
        gateway.set_behavior(GatewayBehavior::Reject("AM04".to_string()));
        let second = gateway.send(&request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(gateway.call_count(), 2);
        assert_eq!(gateway.outcome_for(request.saga_id), Some(first));
    }

    #[tokio::test]
    async fn technical_failure_records_nothing() {
        let gateway = InMemorySettlementGateway::new();
        gateway.set_behavior(GatewayBehavior::Fail("connection reset".to_string()));
        let request = request();

        assert!(gateway.send(&request).await.is_err());
        assert_eq!(gateway.outcome_for(request.saga_id), None);

        gateway.set_behavior(GatewayBehavior::Accept);
        assert!(matches!(
            gateway.send(&request).await.unwrap(),
            SettlementOutcome::Accepted { .. }
        ));
    }
}
