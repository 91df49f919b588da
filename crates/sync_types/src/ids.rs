use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

/// A reference to a single versioned entity: `(entityType, entityId)`.
///
/// Joined as `"type:id"` for use as a map key (spec §3).
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[cfg_attr(
        any(test, feature = "testing"),
        proptest(regex = "[a-zA-Z][a-zA-Z0-9_]{0,15}")
    )]
    pub entity_type: String,
    #[cfg_attr(
        any(test, feature = "testing"),
        proptest(regex = "[a-zA-Z0-9][a-zA-Z0-9_]{0,15}")
    )]
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// The `"type:id"` key form used to index the op-log and entity store.
    pub fn key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Opaque per-request correlation id. Every client->server message and its
/// response(s) carry the same id (spec §4.9); subscription updates reuse the
/// subscription's id until explicit unsubscribe.
pub type MessageId = String;

/// Server-assigned identifier for one client transport connection.
pub type ClientId = uuid::Uuid;

/// Identifies one standing subscription within a client session.
pub type SubscriptionId = String;
