//! Drives sagas from `pix-saga` messages.

use std::sync::Arc;

use async_trait::async_trait;
use dispatcher::{BrokerError, Subscriber};
use domain::outbox::topics;
use store::Store;

use crate::coordinator::PixSagaOrchestrator;
use crate::events::PixSagaEvent;
use crate::gateway::SettlementGateway;

/// Broker subscriber that advances a saga when its previous step is
/// published.
///
/// `saga-created` runs the lock step and `saga-locked` runs settlement.
/// Messages from any topic other than `pix-saga` are acknowledged untouched.
/// Redelivered messages find the saga past the step and do nothing.
/// Retryable failures are returned to the broker so the message is
/// delivered again; permanent ones are logged and acknowledged.
pub struct PixSagaSubscriber<S: Store, G: SettlementGateway> {
    orchestrator: Arc<PixSagaOrchestrator<S, G>>,
}

impl<S: Store, G: SettlementGateway> PixSagaSubscriber<S, G> {
    pub fn new(orchestrator: Arc<PixSagaOrchestrator<S, G>>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl<S, G> Subscriber for PixSagaSubscriber<S, G>
where
    S: Store + 'static,
    G: SettlementGateway + 'static,
{
    #[tracing::instrument(skip(self, payload))]
    async fn handle(&self, topic: &str, payload: &serde_json::Value) -> Result<(), BrokerError> {
        if topic != topics::PIX_SAGA {
            tracing::debug!("ignoring message from another topic");
            return Ok(());
        }

        let event: PixSagaEvent = match serde_json::from_value(payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "undecodable pix-saga payload");
                return Ok(());
            }
        };

        let saga_id = event.saga_id();
        let result = match event {
            PixSagaEvent::SagaCreated { .. } => self.orchestrator.lock_balance(saga_id).await,
            PixSagaEvent::SagaLocked { .. } => self.orchestrator.settle(saga_id).await,
            _ => return Ok(()),
        };

        match result {
            Ok(status) => {
                tracing::debug!(%saga_id, %status, "saga step handled");
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(%saga_id, error = %e, "saga step will be retried");
                Err(BrokerError::Subscriber(e.to_string()))
            }
            Err(e) => {
                tracing::error!(%saga_id, error = %e, "saga step failed permanently");
                Ok(())
            }
        }
    }
}
