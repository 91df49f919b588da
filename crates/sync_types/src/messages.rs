//! Client<->server protocol messages (spec §4.9, §6).
use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value;

use crate::{
    ids::{
        EntityRef,
        MessageId,
    },
    update::Update,
};

pub const PROTOCOL_VERSION: u32 = 2;

/// A tree of field names the caller wants in a query/mutation result: `true`
/// selects a leaf field, a nested map selects a sub-object. `select` is left
/// unspecified beyond this shape; nested-relation semantics are host policy
/// (spec §9, Open Question).
pub type Select = BTreeMap<String, SelectNode>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectNode {
    Leaf(bool),
    Nested(Select),
}

/// `fields` on a subscribe request: either every field, or an explicit
/// allow-list (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldSelector {
    All(AllFields),
    Subset(Vec<String>),
}

/// Marker for the `"*"` wire value of [`FieldSelector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllFields;

impl Serialize for AllFields {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("*")
    }
}

impl<'de> Deserialize<'de> for AllFields {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "*" {
            Ok(AllFields)
        } else {
            Err(serde::de::Error::custom("expected \"*\""))
        }
    }
}

impl FieldSelector {
    pub fn all() -> Self {
        FieldSelector::All(AllFields)
    }

    /// Whether `field` passes this selector.
    pub fn includes(&self, field: &str) -> bool {
        match self {
            FieldSelector::All(_) => true,
            FieldSelector::Subset(fields) => fields.iter().any(|f| f == field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "handshake")]
    Handshake { id: MessageId, protocol_version: u32 },

    #[serde(rename = "query")]
    Query {
        id: MessageId,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        select: Option<Select>,
    },

    #[serde(rename = "mutation")]
    Mutation {
        id: MessageId,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        select: Option<Select>,
    },

    #[serde(rename = "subscribe")]
    Subscribe {
        id: MessageId,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        input: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        fields: Option<FieldSelector>,
    },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { id: MessageId },

    #[serde(rename = "update_fields")]
    UpdateFields {
        id: MessageId,
        fields: FieldSelector,
    },

    #[serde(rename = "reconnect")]
    Reconnect {
        id: MessageId,
        protocol_version: u32,
        subscriptions: Vec<ReconnectSubscriptionRequest>,
        reconnect_id: String,
        client_time: i64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSubscriptionRequest {
    pub id: MessageId,
    pub entity: String,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fields: Option<FieldSelector>,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data_hash: Option<String>,
}

impl ReconnectSubscriptionRequest {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity.clone(), self.entity_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "handshake_ack")]
    HandshakeAck {
        id: MessageId,
        version: u32,
        queries: Vec<String>,
        mutations: Vec<String>,
        subscriptions: Vec<String>,
    },

    #[serde(rename = "data")]
    Data { id: MessageId, data: Value },

    #[serde(rename = "error")]
    Error {
        id: MessageId,
        error: ErrorPayload,
    },

    #[serde(rename = "subscription_ack")]
    SubscriptionAck {
        id: MessageId,
        entity: String,
        entity_id: String,
        version: u64,
        data: Value,
        data_hash: String,
    },

    #[serde(rename = "update")]
    Update {
        id: MessageId,
        entity: String,
        entity_id: String,
        updates: BTreeMap<String, Update>,
    },

    #[serde(rename = "complete")]
    Complete { id: MessageId },

    #[serde(rename = "reconnect_ack")]
    ReconnectAck {
        results: BTreeMap<MessageId, ReconnectResult>,
        server_time: i64,
        reconnect_id: String,
        processing_time_ms: u64,
    },
}

/// Per-subscription outcome of a reconnect request (spec §4.8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReconnectResult {
    Current { version: u64 },
    Patched {
        version: u64,
        patches: Vec<Vec<json_patch::PatchOperation>>,
    },
    Snapshot {
        version: u64,
        data: Value,
        data_hash: String,
    },
    Deleted { version: u64 },
    Error { error: String },
}
