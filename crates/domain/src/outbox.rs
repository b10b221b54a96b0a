//! Transactional outbox writer.
//!
//! Messages are staged through the command's own session, so they become
//! visible exactly when the account and ledger writes they describe commit.
//! Only the dispatcher moves a message past the unprocessed state.

use common::{MessageId, TenantId};
use serde::Serialize;
use store::{OutboxMessage, Session};

use crate::error::Result;

/// Topic names.
pub mod topics {
    /// Account lifecycle and balance changes.
    pub const ACCOUNT_EVENTS: &str = "account-events";
    /// Pix saga progress.
    pub const PIX_SAGA: &str = "pix-saga";
}

/// Stages `payload` for publication on `topic`.
pub async fn enqueue<S, T>(
    session: &mut S,
    tenant_id: TenantId,
    topic: &str,
    payload: &T,
) -> Result<MessageId>
where
    S: Session,
    T: Serialize + Sync,
{
    let message = OutboxMessage::new(tenant_id, topic, serde_json::to_value(payload)?);
    session.enqueue_outbox(&message).await?;
    tracing::debug!(message_id = %message.id, topic, "outbox message staged");
    Ok(message.id)
}
