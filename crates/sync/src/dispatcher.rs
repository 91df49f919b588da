//! Protocol dispatcher (spec §4.9, §6, component C9): the message-pump
//! state machine that classifies an inbound [`ClientMessage`] and routes it
//! through the entity store, fan-out engine and reconnect protocol,
//! producing the matching [`ServerMessage`] response(s). Plays the role of
//! the teacher's `SyncWorker`, narrowed to this core's stateful design
//! (spec §9, Open Question: the spec canonicalizes the stateful handler).
use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use parking_lot::Mutex;
use serde_json::Value;
use sync_core::{
    EntityStateStore,
    OperationLogConfig,
};
use sync_types::{
    ClientId,
    ClientMessage,
    EntityRef,
    FieldSelector,
    MessageId,
    ServerMessage,
    PROTOCOL_VERSION,
};
use tokio::sync::mpsc;

use crate::{
    fanout::{
        self,
        FanoutEngine,
        Outbox,
    },
    reconnect,
};

/// The host's query/mutation/subscription resolvers (spec §1: the
/// router/builder DSL and resolvers are external collaborators, specified
/// only at their interface). `resolve_subscription` maps a named
/// subscription plus its input to the entity it targets; the dispatcher
/// then drives that entity through the state store and fan-out engine
/// itself.
pub trait OperationCatalog: Send + Sync {
    fn queries(&self) -> Vec<String>;
    fn mutations(&self) -> Vec<String>;
    fn subscriptions(&self) -> Vec<String>;

    fn call_query(&self, name: &str, input: Option<Value>) -> anyhow::Result<Value>;
    fn call_mutation(&self, name: &str, input: Option<Value>) -> anyhow::Result<Value>;
    fn resolve_subscription(&self, name: &str, input: Option<Value>) -> anyhow::Result<EntityRef>;
}

struct ClientSubState {
    entity: EntityRef,
    fields: FieldSelector,
}

/// A sharded per-entity-key lock, so `emit` and its immediate broadcast run
/// as one critical section per entity (spec §5: "the version-advance
/// critical section") while different entities proceed in parallel. Mirrors
/// the same `Mutex<HashMap<String, Arc<Mutex<..>>>>` shape `EntityStateStore`
/// itself uses for its per-entity records.
#[derive(Default)]
struct PerEntityLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PerEntityLocks {
    fn with_lock<R>(&self, entity: &EntityRef, f: impl FnOnce() -> R) -> R {
        let slot = self
            .locks
            .lock()
            .entry(entity.key())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = slot.lock();
        f()
    }
}

/// Ties the entity store (C5), fan-out engine (C7) and reconnect protocol
/// (C8) together behind the wire protocol (C9). One instance serves every
/// connected client.
pub struct SyncServer {
    entity_store: Arc<EntityStateStore>,
    fanout: Arc<FanoutEngine>,
    entity_locks: PerEntityLocks,
    client_subs: Mutex<HashMap<ClientId, HashMap<MessageId, ClientSubState>>>,
    reconnect_timeout: Duration,
}

impl SyncServer {
    pub fn new(op_log_config: OperationLogConfig) -> Self {
        Self {
            entity_store: Arc::new(EntityStateStore::new(op_log_config)),
            fanout: Arc::new(FanoutEngine::new()),
            entity_locks: PerEntityLocks::default(),
            client_subs: Mutex::new(HashMap::new()),
            reconnect_timeout: reconnect::DEFAULT_RECONNECT_TIMEOUT,
        }
    }

    pub fn entity_store(&self) -> &Arc<EntityStateStore> {
        &self.entity_store
    }

    pub fn fanout(&self) -> &Arc<FanoutEngine> {
        &self.fanout
    }

    /// Applies a resolver-driven state change and broadcasts it, serialized
    /// against any concurrent emit for the same entity (spec §4.5, §5).
    pub fn emit(&self, entity: &EntityRef, next_data: Value, outbox: &dyn Outbox) -> sync_core::EmitResult {
        self.entity_locks.with_lock(entity, || {
            let result = self.entity_store.emit(entity, next_data);
            self.fanout.broadcast(entity, &result.data, outbox);
            result
        })
    }

    /// Classifies and handles one inbound frame (spec §4, dispatcher step
    /// 2). Returns the direct response, if any — `unsubscribe` and
    /// `update_fields` have none (spec §6); subscription `update` frames are
    /// delivered separately, through `outbox`, by [`Self::emit`].
    pub fn handle_message(
        &self,
        client_id: ClientId,
        message: ClientMessage,
        catalog: &dyn OperationCatalog,
    ) -> Option<ServerMessage> {
        match message {
            ClientMessage::Handshake { id, protocol_version } => {
                Some(self.handle_handshake(id, protocol_version, catalog))
            },
            ClientMessage::Query { id, name, input, .. } => {
                Some(match catalog.call_query(&name, input) {
                    Ok(data) => ServerMessage::Data { id, data },
                    Err(e) => error_message(id, &e),
                })
            },
            ClientMessage::Mutation { id, name, input, .. } => {
                Some(match catalog.call_mutation(&name, input) {
                    Ok(data) => ServerMessage::Data { id, data },
                    Err(e) => error_message(id, &e),
                })
            },
            ClientMessage::Subscribe { id, name, input, fields } => {
                Some(self.handle_subscribe(client_id, id, &name, input, fields, catalog))
            },
            ClientMessage::Unsubscribe { id } => {
                self.handle_unsubscribe(client_id, &id);
                None
            },
            ClientMessage::UpdateFields { id, fields } => {
                self.handle_update_fields(client_id, &id, fields);
                None
            },
            ClientMessage::Reconnect {
                subscriptions,
                reconnect_id,
                ..
            } => Some(reconnect::handle_reconnect(
                &self.entity_store,
                &subscriptions,
                reconnect_id,
                self.reconnect_timeout,
            )),
        }
    }

    fn handle_handshake(
        &self,
        id: MessageId,
        protocol_version: u32,
        catalog: &dyn OperationCatalog,
    ) -> ServerMessage {
        if protocol_version != PROTOCOL_VERSION {
            return error_message(
                id,
                &anyhow::Error::new(ErrorMetadata::parse_error(
                    "ProtocolVersionMismatch",
                    format!(
                        "unsupported protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
                    ),
                )),
            );
        }
        ServerMessage::HandshakeAck {
            id,
            version: PROTOCOL_VERSION,
            queries: catalog.queries(),
            mutations: catalog.mutations(),
            subscriptions: catalog.subscriptions(),
        }
    }

    fn handle_subscribe(
        &self,
        client_id: ClientId,
        id: MessageId,
        name: &str,
        input: Option<Value>,
        fields: Option<FieldSelector>,
        catalog: &dyn OperationCatalog,
    ) -> ServerMessage {
        let entity = match catalog.resolve_subscription(name, input) {
            Ok(entity) => entity,
            Err(e) => return error_message(id, &e),
        };
        let fields = fields.unwrap_or_else(FieldSelector::all);

        let data = self.entity_store.get_state(&entity).unwrap_or(Value::Null);
        let version = self.entity_store.get_version(&entity);
        let filtered = fanout::filter_fields(&data, &fields);
        let data_hash = sync_core::data_hash(&filtered);

        self.fanout.subscribe(client_id, id.clone(), &entity, fields.clone());
        self.fanout.prime(client_id, &entity, filtered.clone());
        self.client_subs
            .lock()
            .entry(client_id)
            .or_default()
            .insert(id.clone(), ClientSubState { entity: entity.clone(), fields });

        ServerMessage::SubscriptionAck {
            id,
            entity: entity.entity_type,
            entity_id: entity.entity_id,
            version,
            data: filtered,
            data_hash,
        }
    }

    fn handle_unsubscribe(&self, client_id: ClientId, id: &MessageId) {
        if let Some(subs) = self.client_subs.lock().get_mut(&client_id) {
            subs.remove(id);
        }
        self.fanout.unsubscribe(client_id, id);
    }

    fn handle_update_fields(&self, client_id: ClientId, id: &MessageId, fields: FieldSelector) {
        let entity = {
            let subs = self.client_subs.lock();
            subs.get(&client_id).and_then(|m| m.get(id)).map(|s| s.entity.clone())
        };
        let Some(entity) = entity else {
            return;
        };
        self.fanout.subscribe(client_id, id.clone(), &entity, fields.clone());
        if let Some(subs) = self.client_subs.lock().get_mut(&client_id) {
            if let Some(sub) = subs.get_mut(id) {
                sub.fields = fields;
            }
        }
    }

    /// Client disconnect: cancel all outstanding subscription work for that
    /// client (spec §5).
    pub fn disconnect(&self, client_id: ClientId) {
        self.fanout.disconnect(client_id);
        self.client_subs.lock().remove(&client_id);
    }
}

fn error_message(id: MessageId, err: &anyhow::Error) -> ServerMessage {
    err.record_metric();
    let payload = err.error_payload();
    ServerMessage::Error {
        id,
        error: sync_types::ErrorPayload {
            code: payload.code,
            message: payload.message,
        },
    }
}

/// How often the dispatcher should signal a keepalive to each connected
/// client (SPEC_FULL's heartbeat supplement). Not a wire message: see
/// [`HeartbeatSink`].
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-client ordered egress queue (spec §5: "each client has an ordered
/// egress queue"). A thin `tokio::mpsc` registry the host drains into its
/// transport; doubles as the default [`Outbox`] implementation.
#[derive(Default)]
pub struct EgressRegistry {
    senders: Mutex<HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>>>,
}

impl EgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `client_id`, returning the receiving half the host's
    /// connection task should drain and write to the transport.
    pub fn register(&self, client_id: ClientId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().insert(client_id, tx);
        rx
    }

    pub fn unregister(&self, client_id: ClientId) {
        self.senders.lock().remove(&client_id);
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.senders.lock().keys().copied().collect()
    }
}

impl Outbox for EgressRegistry {
    fn send(&self, client_id: ClientId, message: ServerMessage) {
        let senders = self.senders.lock();
        if let Some(tx) = senders.get(&client_id) {
            if tx.send(message).is_err() {
                tracing::debug!(%client_id, "dropped frame for a client whose egress queue is gone");
            }
        }
    }
}

/// Receives the periodic keepalive signal (SPEC_FULL's heartbeat
/// supplement). Deliberately not a [`ServerMessage`] variant: §6's message
/// catalogue is closed, and a transport-level ping belongs to the host's
/// framing, not this wire schema.
pub trait HeartbeatSink: Send + Sync {
    fn on_heartbeat(&self, client_id: ClientId);
}

/// Ticks every `interval`, signalling `sink` for each client currently
/// registered in `egress`. Intended to be spawned by the host alongside its
/// transport loop.
pub async fn run_heartbeat(egress: Arc<EgressRegistry>, sink: Arc<dyn HeartbeatSink>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        for client_id in egress.client_ids() {
            sink.on_heartbeat(client_id);
        }
    }
}

/// Drives the operation log's background eviction (spec §4.4
/// `cleanupInterval`). Intended to be spawned alongside the transport loop.
pub async fn run_cleanup_loop(entity_store: Arc<EntityStateStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        entity_store.op_log().cleanup();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sync_types::FieldSelector;

    use super::*;

    struct TestCatalog;

    impl OperationCatalog for TestCatalog {
        fn queries(&self) -> Vec<String> {
            vec!["getPost".to_string()]
        }

        fn mutations(&self) -> Vec<String> {
            vec!["createPost".to_string()]
        }

        fn subscriptions(&self) -> Vec<String> {
            vec!["watchPost".to_string()]
        }

        fn call_query(&self, name: &str, _input: Option<Value>) -> anyhow::Result<Value> {
            match name {
                "getPost" => Ok(json!({"title": "A"})),
                _ => Err(anyhow::Error::new(ErrorMetadata::not_found(
                    "UnknownQuery",
                    format!("no query named {name}"),
                ))),
            }
        }

        fn call_mutation(&self, _name: &str, _input: Option<Value>) -> anyhow::Result<Value> {
            Ok(json!({"ok": true}))
        }

        fn resolve_subscription(&self, name: &str, _input: Option<Value>) -> anyhow::Result<EntityRef> {
            match name {
                "watchPost" => Ok(EntityRef::new("Post", "1")),
                _ => Err(anyhow::Error::new(ErrorMetadata::not_found(
                    "UnknownSubscription",
                    format!("no subscription named {name}"),
                ))),
            }
        }
    }

    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<(ClientId, ServerMessage)>>,
    }

    impl Outbox for RecordingOutbox {
        fn send(&self, client_id: ClientId, message: ServerMessage) {
            self.sent.lock().push((client_id, message));
        }
    }

    #[test]
    fn handshake_lists_catalog_operations() {
        let server = SyncServer::new(OperationLogConfig::default());
        let client = ClientId::new_v4();
        let response = server
            .handle_message(
                client,
                ClientMessage::Handshake {
                    id: "1".to_string(),
                    protocol_version: PROTOCOL_VERSION,
                },
                &TestCatalog,
            )
            .unwrap();
        match response {
            ServerMessage::HandshakeAck { queries, .. } => {
                assert_eq!(queries, vec!["getPost".to_string()]);
            },
            other => panic!("expected HandshakeAck, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_protocol_version_is_parse_error() {
        let server = SyncServer::new(OperationLogConfig::default());
        let client = ClientId::new_v4();
        let response = server
            .handle_message(
                client,
                ClientMessage::Handshake {
                    id: "1".to_string(),
                    protocol_version: 999,
                },
                &TestCatalog,
            )
            .unwrap();
        match response {
            ServerMessage::Error { error, .. } => assert_eq!(error.code, "parse_error"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn query_dispatches_to_catalog() {
        let server = SyncServer::new(OperationLogConfig::default());
        let client = ClientId::new_v4();
        let response = server
            .handle_message(
                client,
                ClientMessage::Query {
                    id: "1".to_string(),
                    name: "getPost".to_string(),
                    input: None,
                    select: None,
                },
                &TestCatalog,
            )
            .unwrap();
        assert_eq!(response, ServerMessage::Data { id: "1".to_string(), data: json!({"title": "A"}) });
    }

    #[test]
    fn unknown_query_is_not_found() {
        let server = SyncServer::new(OperationLogConfig::default());
        let client = ClientId::new_v4();
        let response = server
            .handle_message(
                client,
                ClientMessage::Query {
                    id: "1".to_string(),
                    name: "nope".to_string(),
                    input: None,
                    select: None,
                },
                &TestCatalog,
            )
            .unwrap();
        match response {
            ServerMessage::Error { error, .. } => assert_eq!(error.code, "not_found"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_then_emit_delivers_an_update() {
        let server = SyncServer::new(OperationLogConfig::default());
        let client = ClientId::new_v4();
        server.emit(&EntityRef::new("Post", "1"), json!({"title": "A"}), &RecordingOutbox::default());

        let ack = server
            .handle_message(
                client,
                ClientMessage::Subscribe {
                    id: "sub1".to_string(),
                    name: "watchPost".to_string(),
                    input: None,
                    fields: None,
                },
                &TestCatalog,
            )
            .unwrap();
        match ack {
            ServerMessage::SubscriptionAck { version, data, .. } => {
                assert_eq!(version, 1);
                assert_eq!(data, json!({"title": "A"}));
            },
            other => panic!("expected SubscriptionAck, got {other:?}"),
        }

        let outbox = RecordingOutbox::default();
        server.emit(&EntityRef::new("Post", "1"), json!({"title": "B"}), &outbox);
        let sent = outbox.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, client);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let server = SyncServer::new(OperationLogConfig::default());
        let client = ClientId::new_v4();
        server
            .handle_message(
                client,
                ClientMessage::Subscribe {
                    id: "sub1".to_string(),
                    name: "watchPost".to_string(),
                    input: None,
                    fields: None,
                },
                &TestCatalog,
            )
            .unwrap();
        let response = server.handle_message(
            client,
            ClientMessage::Unsubscribe { id: "sub1".to_string() },
            &TestCatalog,
        );
        assert!(response.is_none());

        let outbox = RecordingOutbox::default();
        server.emit(&EntityRef::new("Post", "1"), json!({"title": "C"}), &outbox);
        assert!(outbox.sent.lock().is_empty());
    }

    #[test]
    fn disconnect_purges_all_of_a_clients_subscriptions() {
        let server = SyncServer::new(OperationLogConfig::default());
        let client = ClientId::new_v4();
        server
            .handle_message(
                client,
                ClientMessage::Subscribe {
                    id: "sub1".to_string(),
                    name: "watchPost".to_string(),
                    input: None,
                    fields: None,
                },
                &TestCatalog,
            )
            .unwrap();
        server.disconnect(client);

        let outbox = RecordingOutbox::default();
        server.emit(&EntityRef::new("Post", "1"), json!({"title": "D"}), &outbox);
        assert!(outbox.sent.lock().is_empty());
    }

    #[test]
    fn update_fields_narrows_future_frames() {
        let server = SyncServer::new(OperationLogConfig::default());
        let client = ClientId::new_v4();
        server
            .handle_message(
                client,
                ClientMessage::Subscribe {
                    id: "sub1".to_string(),
                    name: "watchPost".to_string(),
                    input: None,
                    fields: None,
                },
                &TestCatalog,
            )
            .unwrap();

        server.handle_message(
            client,
            ClientMessage::UpdateFields {
                id: "sub1".to_string(),
                fields: FieldSelector::Subset(vec!["title".to_string()]),
            },
            &TestCatalog,
        );

        let outbox = RecordingOutbox::default();
        server.emit(
            &EntityRef::new("Post", "1"),
            json!({"title": "A", "body": "new"}),
            &outbox,
        );
        let sent = outbox.sent.lock();
        match &sent[0].1 {
            ServerMessage::Update { updates, .. } => assert!(!updates.contains_key("body")),
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn reconnect_reports_current_for_unmoved_subscription() {
        let server = SyncServer::new(OperationLogConfig::default());
        let client = ClientId::new_v4();
        server.emit(&EntityRef::new("Post", "1"), json!({"n": 1}), &RecordingOutbox::default());

        let response = server
            .handle_message(
                client,
                ClientMessage::Reconnect {
                    id: "r1".to_string(),
                    protocol_version: PROTOCOL_VERSION,
                    subscriptions: vec![sync_types::ReconnectSubscriptionRequest {
                        id: "sub1".to_string(),
                        entity: "Post".to_string(),
                        entity_id: "1".to_string(),
                        fields: None,
                        version: 1,
                        data_hash: None,
                    }],
                    reconnect_id: "rc1".to_string(),
                    client_time: 0,
                },
                &TestCatalog,
            )
            .unwrap();

        match response {
            ServerMessage::ReconnectAck { results, .. } => {
                assert_eq!(
                    results.get("sub1"),
                    Some(&sync_types::ReconnectResult::Current { version: 1 })
                );
            },
            other => panic!("expected ReconnectAck, got {other:?}"),
        }
    }
}
