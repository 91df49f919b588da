//! Fan-out engine (spec §4.7, component C7): the server-side counterpart to
//! [`crate::registry::SubscriptionRegistry`]. Routes one entity's emit to
//! every subscriber and computes a minimal per-field update for each,
//! against that subscriber's own last-sent state.
use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
};

use parking_lot::Mutex;
use serde_json::{
    Map,
    Value,
};
use sync_types::{
    ClientId,
    EntityRef,
    FieldSelector,
    MessageId,
    ServerMessage,
    SubscriptionId,
};

use crate::metrics;

/// Where the fan-out engine (and the dispatcher) deliver outbound frames.
/// A thin seam over the host's actual transport egress queue (spec §5:
/// "each client has an ordered egress queue").
pub trait Outbox: Send + Sync {
    fn send(&self, client_id: ClientId, message: ServerMessage);
}

/// Filters `data` down to `fields`, cloning only what survives (spec §4.7
/// step 1). Entity data is always an object keyed by field name (spec §3);
/// a non-object `data` passes through `FieldSelector::All` unchanged but
/// yields an empty object under `FieldSelector::Subset`.
pub fn filter_fields(data: &Value, fields: &FieldSelector) -> Value {
    match fields {
        FieldSelector::All(_) => data.clone(),
        FieldSelector::Subset(names) => {
            let mut out = Map::new();
            if let Some(obj) = data.as_object() {
                for name in names {
                    if let Some(v) = obj.get(name) {
                        out.insert(name.clone(), v.clone());
                    }
                }
            }
            Value::Object(out)
        },
    }
}

#[derive(Clone)]
struct SubscriberInfo {
    sub_id: SubscriptionId,
    fields: FieldSelector,
}

#[derive(Default)]
struct FanoutState {
    /// entityKey -> clientId -> subscriber info (spec's `entitySubscribers`,
    /// narrowed to one subscription per client per entity: the source
    /// structure keys `clientState`/`clientFields` the same way).
    entity_subscribers: HashMap<String, HashMap<ClientId, SubscriberInfo>>,
    /// clientId -> entityKey -> last data sent to that client for that
    /// entity (spec's `clientState`), used as the `prev` side of the next
    /// diff.
    client_state: HashMap<ClientId, HashMap<String, Value>>,
    /// subscriptionId -> (clientId, entityKey), for `unsubscribe` callers
    /// that only have the subscription id.
    subs_by_id: HashMap<SubscriptionId, (ClientId, String)>,
}

/// Server-side subscription index and diff cache (spec §4.7).
#[derive(Default)]
pub struct FanoutEngine {
    state: Mutex<FanoutState>,
}

impl FanoutEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        client_id: ClientId,
        sub_id: SubscriptionId,
        entity: &EntityRef,
        fields: FieldSelector,
    ) {
        let key = entity.key();
        let mut state = self.state.lock();
        state
            .entity_subscribers
            .entry(key.clone())
            .or_default()
            .insert(client_id, SubscriberInfo { sub_id: sub_id.clone(), fields });
        state.subs_by_id.insert(sub_id, (client_id, key));
        metrics::record_subscribe();
    }

    /// Removes subscription `sub_id`; drops the empty reverse-index entry
    /// and that client's cached state for the entity (spec §4.7
    /// `unsubscribe`).
    pub fn unsubscribe(&self, client_id: ClientId, sub_id: &SubscriptionId) {
        let mut state = self.state.lock();
        let Some((owner, key)) = state.subs_by_id.remove(sub_id) else {
            return;
        };
        if owner != client_id {
            // Stale id from a different client; put it back untouched.
            state.subs_by_id.insert(sub_id.clone(), (owner, key));
            return;
        }
        if let Some(subs) = state.entity_subscribers.get_mut(&key) {
            subs.remove(&client_id);
            if subs.is_empty() {
                state.entity_subscribers.remove(&key);
            }
        }
        if let Some(per_client) = state.client_state.get_mut(&client_id) {
            per_client.remove(&key);
        }
        metrics::record_unsubscribe();
    }

    /// Records `data` as the state already delivered to `client_id` for
    /// `entity`, without sending anything. Called right after the initial
    /// `subscription_ack` (spec §4, dispatcher step 4) so the *next*
    /// `broadcast` computes a real diff instead of re-sending everything as
    /// a fresh full snapshot (spec invariant 4).
    pub fn prime(&self, client_id: ClientId, entity: &EntityRef, data: Value) {
        self.state
            .lock()
            .client_state
            .entry(client_id)
            .or_default()
            .insert(entity.key(), data);
    }

    /// Purges every subscription owned by `client_id` (spec §4.7
    /// `disconnect`).
    pub fn disconnect(&self, client_id: ClientId) {
        let mut state = self.state.lock();
        state.client_state.remove(&client_id);
        state.entity_subscribers.retain(|_, subs| {
            subs.remove(&client_id);
            !subs.is_empty()
        });
        state.subs_by_id.retain(|_, (owner, _)| *owner != client_id);
    }

    /// Routes one entity emit to its subscribers (spec §4.7 `broadcast`).
    /// Per-subscriber work is isolated: a panic computing one subscriber's
    /// update falls back to a full `value` snapshot for that subscriber and
    /// is logged as an internal error, per the propagation policy in §7 —
    /// other subscribers still proceed.
    pub fn broadcast(&self, entity: &EntityRef, next_data: &Value, outbox: &dyn Outbox) {
        let key = entity.key();
        let subscribers: Vec<(ClientId, SubscriberInfo)> = {
            let state = self.state.lock();
            match state.entity_subscribers.get(&key) {
                Some(subs) => subs.iter().map(|(cid, info)| (*cid, info.clone())).collect(),
                None => return,
            }
        };

        for (client_id, info) in subscribers {
            let prev = {
                let state = self.state.lock();
                state
                    .client_state
                    .get(&client_id)
                    .and_then(|m| m.get(&key))
                    .cloned()
            };

            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                diff_for_subscriber(entity, &prev, next_data, &info)
            }));

            let (filtered, message) = match outcome {
                Ok((filtered, message)) => (filtered, message),
                Err(_) => {
                    tracing::error!(
                        entity = %key,
                        sub_id = %info.sub_id,
                        "fan-out diff computation panicked; falling back to a full snapshot"
                    );
                    metrics::record_broadcast_outcome("panic_fallback");
                    let filtered = filter_fields(next_data, &info.fields);
                    let message = Some(full_snapshot(&info.sub_id, entity, &filtered));
                    (filtered, message)
                },
            };

            if let Some(message) = message {
                outbox.send(client_id, message);
                let mut state = self.state.lock();
                state
                    .client_state
                    .entry(client_id)
                    .or_default()
                    .insert(key.clone(), filtered);
                metrics::record_broadcast_outcome("sent");
            } else {
                metrics::record_broadcast_outcome("skipped_no_change");
            }
        }
    }
}

/// Computes the filtered next state and, if anything changed, the message
/// to send for one subscriber. Pure and panic-free in the expected case;
/// wrapped in `catch_unwind` by the caller as a defensive boundary.
fn diff_for_subscriber(
    entity: &EntityRef,
    prev: &Option<Value>,
    next_data: &Value,
    info: &SubscriberInfo,
) -> (Value, Option<ServerMessage>) {
    let filtered = filter_fields(next_data, &info.fields);
    let message = match prev {
        None => Some(full_snapshot(&info.sub_id, entity, &filtered)),
        Some(prev_data) => diff_update(&info.sub_id, entity, prev_data, &filtered),
    };
    (filtered, message)
}

fn full_snapshot(sub_id: &MessageId, entity: &EntityRef, filtered: &Value) -> ServerMessage {
    let mut updates = std::collections::BTreeMap::new();
    if let Some(obj) = filtered.as_object() {
        for (field, value) in obj {
            updates.insert(field.clone(), sync_types::Update::Value(value.clone()));
        }
    }
    ServerMessage::Update {
        id: sub_id.clone(),
        entity: entity.entity_type.clone(),
        entity_id: entity.entity_id.clone(),
        updates,
    }
}

/// Diffs every field present in either side (spec's dirty-field
/// computation supplement): a field dropped from `next` is represented as
/// its value transitioning to `null`, not silently omitted.
fn diff_update(
    sub_id: &MessageId,
    entity: &EntityRef,
    prev: &Value,
    next: &Value,
) -> Option<ServerMessage> {
    let empty = Map::new();
    let prev_obj = prev.as_object().unwrap_or(&empty);
    let next_obj = next.as_object().unwrap_or(&empty);

    let mut fields: Vec<&String> = prev_obj.keys().chain(next_obj.keys()).collect();
    fields.sort();
    fields.dedup();

    let mut updates = std::collections::BTreeMap::new();
    for field in fields {
        let prev_val = prev_obj.get(field).cloned().unwrap_or(Value::Null);
        let next_val = next_obj.get(field).cloned().unwrap_or(Value::Null);
        if let Some(update) = sync_core::encode(&prev_val, &next_val) {
            updates.insert(field.clone(), update);
        }
    }

    if updates.is_empty() {
        return None;
    }

    Some(ServerMessage::Update {
        id: sub_id.clone(),
        entity: entity.entity_type.clone(),
        entity_id: entity.entity_id.clone(),
        updates,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;
    use sync_types::Update;

    use super::*;

    #[derive(Default)]
    struct RecordingOutbox {
        sent: StdMutex<Vec<(ClientId, ServerMessage)>>,
    }

    impl Outbox for RecordingOutbox {
        fn send(&self, client_id: ClientId, message: ServerMessage) {
            self.sent.lock().unwrap().push((client_id, message));
        }
    }

    fn entity() -> EntityRef {
        EntityRef::new("Post", "1")
    }

    #[test]
    fn first_broadcast_sends_full_snapshot() {
        let fanout = FanoutEngine::new();
        let client = ClientId::new_v4();
        fanout.subscribe(client, "s1".to_string(), &entity(), FieldSelector::all());

        let outbox = RecordingOutbox::default();
        fanout.broadcast(&entity(), &json!({"title": "A", "body": "hi"}), &outbox);

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            ServerMessage::Update { updates, .. } => {
                assert_eq!(updates.get("title"), Some(&Update::Value(json!("A"))));
                assert_eq!(updates.get("body"), Some(&Update::Value(json!("hi"))));
            },
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn unchanged_fields_are_not_resent() {
        let fanout = FanoutEngine::new();
        let client = ClientId::new_v4();
        fanout.subscribe(client, "s1".to_string(), &entity(), FieldSelector::all());

        let outbox = RecordingOutbox::default();
        fanout.broadcast(&entity(), &json!({"title": "A", "body": "hi"}), &outbox);
        fanout.broadcast(&entity(), &json!({"title": "A", "body": "bye"}), &outbox);

        let sent = outbox.sent.lock().unwrap();
        match &sent[1].1 {
            ServerMessage::Update { updates, .. } => {
                assert_eq!(updates.len(), 1);
                assert!(updates.contains_key("body"));
            },
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn no_change_sends_nothing() {
        let fanout = FanoutEngine::new();
        let client = ClientId::new_v4();
        fanout.subscribe(client, "s1".to_string(), &entity(), FieldSelector::all());

        let outbox = RecordingOutbox::default();
        fanout.broadcast(&entity(), &json!({"title": "A"}), &outbox);
        fanout.broadcast(&entity(), &json!({"title": "A"}), &outbox);

        assert_eq!(outbox.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn field_subset_filters_updates() {
        let fanout = FanoutEngine::new();
        let client = ClientId::new_v4();
        fanout.subscribe(
            client,
            "s1".to_string(),
            &entity(),
            FieldSelector::Subset(vec!["title".to_string()]),
        );

        let outbox = RecordingOutbox::default();
        fanout.broadcast(&entity(), &json!({"title": "A", "body": "hi"}), &outbox);
        fanout.broadcast(&entity(), &json!({"title": "A", "body": "bye"}), &outbox);

        // Only the first (initial snapshot) frame should have been sent;
        // `body` isn't in this subscriber's field set so the second emit
        // produces no change for it.
        assert_eq!(outbox.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_future_broadcasts() {
        let fanout = FanoutEngine::new();
        let client = ClientId::new_v4();
        fanout.subscribe(client, "s1".to_string(), &entity(), FieldSelector::all());
        fanout.unsubscribe(client, &"s1".to_string());

        let outbox = RecordingOutbox::default();
        fanout.broadcast(&entity(), &json!({"title": "A"}), &outbox);
        assert!(outbox.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn disconnect_removes_all_of_a_clients_subscriptions() {
        let fanout = FanoutEngine::new();
        let a = ClientId::new_v4();
        let b = ClientId::new_v4();
        fanout.subscribe(a, "sa".to_string(), &entity(), FieldSelector::all());
        fanout.subscribe(b, "sb".to_string(), &entity(), FieldSelector::all());
        fanout.disconnect(a);

        let outbox = RecordingOutbox::default();
        fanout.broadcast(&entity(), &json!({"title": "A"}), &outbox);
        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);
    }

    #[test]
    fn removed_field_transitions_to_null() {
        let fanout = FanoutEngine::new();
        let client = ClientId::new_v4();
        fanout.subscribe(client, "s1".to_string(), &entity(), FieldSelector::all());

        let outbox = RecordingOutbox::default();
        fanout.broadcast(&entity(), &json!({"title": "A", "draft": true}), &outbox);
        fanout.broadcast(&entity(), &json!({"title": "A"}), &outbox);

        match &outbox.sent.lock().unwrap()[1].1 {
            ServerMessage::Update { updates, .. } => {
                assert_eq!(updates.get("draft"), Some(&Update::Value(Value::Null)));
            },
            other => panic!("expected Update, got {other:?}"),
        }
    }
}
