use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each id wraps a UUID to provide type safety and prevent mixing up
/// account ids with tenant ids, saga ids and so on.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a customer account.
    AccountId
);

uuid_id!(
    /// Identifier of the tenant (institution) that owns an account.
    TenantId
);

uuid_id!(
    /// Links every ledger event produced by one logical operation.
    CorrelationId
);

uuid_id!(
    /// Identifier of a Pix payment saga.
    SagaId
);

uuid_id!(
    /// Identifier of an outbox message.
    MessageId
);

uuid_id!(
    /// Identifier of a single ledger event.
    LedgerEventId
);

impl From<SagaId> for CorrelationId {
    /// A saga's ledger entries are correlated by the saga id itself.
    fn from(id: SagaId) -> Self {
        Self(id.0)
    }
}

/// Client-supplied command identifier used as the idempotency key.
///
/// Clients may use any opaque string (often a UUID they generated), so this
/// is not UUID-backed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Creates a command id from a client-supplied key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a fresh random command id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the command id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CommandId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_new_creates_unique_ids() {
        let id1 = AccountId::new();
        let id2 = AccountId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn tenant_id_from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = TenantId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn saga_id_serializes_as_plain_uuid() {
        let id = SagaId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
        let deserialized: SagaId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn saga_id_converts_to_correlation_id() {
        let saga_id = SagaId::new();
        let correlation: CorrelationId = saga_id.into();
        assert_eq!(correlation.as_uuid(), saga_id.as_uuid());
    }

    #[test]
    fn account_ids_order_by_uuid() {
        let low = AccountId::from_uuid(Uuid::from_u128(1));
        let high = AccountId::from_uuid(Uuid::from_u128(2));
        assert!(low < high);
    }

    #[test]
    fn command_id_from_client_string() {
        let id = CommandId::from("cmd-42");
        assert_eq!(id.as_str(), "cmd-42");
        assert_eq!(id.to_string(), "cmd-42");
    }
}
