//! Message broker contract and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common::MessageId;
use store::OutboxMessage;

use crate::error::BrokerError;

/// The downstream message bus.
///
/// Delivery is at-least-once: a message whose publish failed, or whose
/// success was not recorded, is published again.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes one outbox message on its topic.
    async fn publish(&self, message: &OutboxMessage) -> Result<(), BrokerError>;
}

/// Consumer of a topic.
///
/// Handlers must tolerate redelivery of the same payload.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, topic: &str, payload: &serde_json::Value) -> Result<(), BrokerError>;
}

#[derive(Default)]
struct InMemoryBrokerState {
    published: Vec<OutboxMessage>,
    failing: HashSet<MessageId>,
    unavailable: Option<String>,
    subscribers: HashMap<String, Vec<Arc<dyn Subscriber>>>,
}

/// In-memory broker for tests and single-process deployments.
///
/// Records every successful publish and fans each message out to the
/// subscribers of its topic. A subscriber error fails the publish, so the
/// dispatcher retries the message.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<InMemoryBrokerState>>,
}

impl InMemoryBroker {
    /// Creates a broker with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, InMemoryBrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber for `topic`.
    pub fn subscribe(&self, topic: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
        self.state()
            .subscribers
            .entry(topic.into())
            .or_default()
            .push(subscriber);
    }

    /// Makes every publish of message `id` fail until [`Self::heal`].
    pub fn fail_message(&self, id: MessageId) {
        self.state().failing.insert(id);
    }

    /// Lets message `id` through again.
    pub fn heal(&self, id: MessageId) {
        self.state().failing.remove(&id);
    }

    /// Makes every publish fail with `reason`, or restores the broker.
    pub fn set_unavailable(&self, reason: Option<String>) {
        self.state().unavailable = reason;
    }

    /// Messages published so far, in publish order.
    pub fn published(&self) -> Vec<OutboxMessage> {
        self.state().published.clone()
    }

    pub fn published_count(&self) -> usize {
        self.state().published.len()
    }

    /// Messages published on `topic`, in publish order.
    pub fn published_to(&self, topic: &str) -> Vec<OutboxMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryBroker")
            .field("published", &state.published.len())
            .field("topics", &state.subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), BrokerError> {
        let subscribers = {
            let mut state = self.state();
            if let Some(reason) = &state.unavailable {
                return Err(BrokerError::Unavailable(reason.clone()));
            }
            if state.failing.contains(&message.id) {
                return Err(BrokerError::Rejected {
                    topic: message.topic.clone(),
                    reason: format!("message {} is marked to fail", message.id),
                });
            }
            state.published.push(message.clone());
            state
                .subscribers
                .get(&message.topic)
                .cloned()
                .unwrap_or_default()
        };

        for subscriber in subscribers {
            subscriber.handle(&message.topic, &message.payload).await?;
        }
        Ok(())
    }
}
