//! Reconnect protocol (spec §4.8, component C8): per-subscription
//! catch-up decision after a transport reconnect, and the batch handler
//! that assembles a `reconnect_ack` from many such decisions.
use std::{
    panic::AssertUnwindSafe,
    time::{
        Duration,
        Instant,
    },
};

use serde_json::Value;
use sync_core::EntityStateStore;
use sync_types::{
    ReconnectResult,
    ReconnectSubscriptionRequest,
    ServerMessage,
};

use crate::{
    metrics,
    now_ms,
};

/// Reconnect decision steps are synchronous and non-blocking (spec §5), so
/// this bound only guards against a pathologically large subscription
/// batch, not I/O latency.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The decision tree of spec §4.8 for one subscription.
pub fn compute_reconnect_result(
    entity_store: &EntityStateStore,
    req: &ReconnectSubscriptionRequest,
) -> ReconnectResult {
    let entity = req.entity_ref();

    if !entity_store.exists(&entity) {
        return ReconnectResult::Deleted { version: 0 };
    }

    let current_version = entity_store.get_version(&entity);
    if req.version >= current_version {
        return ReconnectResult::Current {
            version: current_version,
        };
    }

    if let Some(entries) = entity_store.op_log().get_since(&entity, req.version) {
        if entries.is_empty() {
            // `req.version < current_version` yet nothing retained past it:
            // the entity hasn't moved since `req.version` was observed from
            // a stale read. Treat as already caught up.
            return ReconnectResult::Current {
                version: current_version,
            };
        }

        // Advisory shortcut: if the client's reported hash already matches
        // the server's current data, skip sending patches it doesn't need.
        if let Some(expected_hash) = &req.data_hash {
            let current_data = entity_store.get_state(&entity).unwrap_or(Value::Null);
            if &sync_core::data_hash(&current_data) == expected_hash {
                return ReconnectResult::Current {
                    version: current_version,
                };
            }
        }

        return ReconnectResult::Patched {
            version: current_version,
            patches: entries.into_iter().map(|e| e.patch).collect(),
        };
    }

    let data = entity_store.get_state(&entity).unwrap_or(Value::Null);
    let data_hash = sync_core::data_hash(&data);
    ReconnectResult::Snapshot {
        version: current_version,
        data,
        data_hash,
    }
}

/// Builds a `reconnect_ack` for a whole reconnect request (spec §4.8,
/// §6). One subscription's decision panicking, or the batch exceeding
/// `timeout`, surfaces as that subscription's own `error` result (spec
/// §5, §7) rather than failing the batch.
pub fn handle_reconnect(
    entity_store: &EntityStateStore,
    subscriptions: &[ReconnectSubscriptionRequest],
    reconnect_id: String,
    timeout: Duration,
) -> ServerMessage {
    let start = Instant::now();
    let mut results = std::collections::BTreeMap::new();

    for sub in subscriptions {
        let result = if start.elapsed() > timeout {
            ReconnectResult::Error {
                error: "reconnect processing timed out".to_string(),
            }
        } else {
            std::panic::catch_unwind(AssertUnwindSafe(|| compute_reconnect_result(entity_store, sub)))
                .unwrap_or_else(|_| {
                    tracing::error!(sub_id = %sub.id, "reconnect decision panicked");
                    ReconnectResult::Error {
                        error: "internal error computing reconnect result".to_string(),
                    }
                })
        };
        metrics::record_reconnect_result(&result);
        results.insert(sub.id.clone(), result);
    }

    ServerMessage::ReconnectAck {
        results,
        server_time: now_ms(),
        reconnect_id,
        processing_time_ms: start.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sync_core::OperationLogConfig;
    use sync_types::EntityRef;

    use super::*;

    fn req(entity: &EntityRef, version: u64) -> ReconnectSubscriptionRequest {
        req_with_id("s1", entity, version)
    }

    fn req_with_id(id: &str, entity: &EntityRef, version: u64) -> ReconnectSubscriptionRequest {
        ReconnectSubscriptionRequest {
            id: id.to_string(),
            entity: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            fields: None,
            version,
            data_hash: None,
        }
    }

    #[test]
    fn unknown_entity_is_deleted() {
        let store = EntityStateStore::new(OperationLogConfig::default());
        let entity = EntityRef::new("Post", "1");
        let result = compute_reconnect_result(&store, &req(&entity, 0));
        assert_eq!(result, ReconnectResult::Deleted { version: 0 });
    }

    #[test]
    fn up_to_date_client_is_current() {
        let store = EntityStateStore::new(OperationLogConfig::default());
        let entity = EntityRef::new("Post", "1");
        store.emit(&entity, json!({"n": 1}));
        let result = compute_reconnect_result(&store, &req(&entity, 1));
        assert_eq!(result, ReconnectResult::Current { version: 1 });
    }

    #[test]
    fn retained_history_yields_patched() {
        let store = EntityStateStore::new(OperationLogConfig::default());
        let entity = EntityRef::new("Post", "1");
        store.emit(&entity, json!({"n": 1}));
        store.emit(&entity, json!({"n": 2}));
        store.emit(&entity, json!({"n": 3}));

        let result = compute_reconnect_result(&store, &req(&entity, 1));
        match result {
            ReconnectResult::Patched { version, patches } => {
                assert_eq!(version, 3);
                assert_eq!(patches.len(), 2);
                let mut state = json!({"n": 1});
                for patch in &patches {
                    state = sync_core::apply_patch(&state, patch).unwrap();
                }
                assert_eq!(state, json!({"n": 3}));
            },
            other => panic!("expected Patched, got {other:?}"),
        }
    }

    #[test]
    fn evicted_history_falls_back_to_snapshot() {
        let mut config = OperationLogConfig::default();
        config.max_entries = 1;
        let store = EntityStateStore::new(config);
        let entity = EntityRef::new("Post", "1");
        for n in 1..=5 {
            store.emit(&entity, json!({"n": n}));
        }

        let result = compute_reconnect_result(&store, &req(&entity, 1));
        match result {
            ReconnectResult::Snapshot { version, data, .. } => {
                assert_eq!(version, 5);
                assert_eq!(data, json!({"n": 5}));
            },
            other => panic!("expected Snapshot, got {other:?}"),
        }
    }

    #[test]
    fn matching_data_hash_collapses_to_current() {
        let store = EntityStateStore::new(OperationLogConfig::default());
        let entity = EntityRef::new("Post", "1");
        store.emit(&entity, json!({"n": 1}));
        store.emit(&entity, json!({"n": 1}));
        store.emit(&entity, json!({"n": 1}));

        let mut request = req(&entity, 1);
        request.data_hash = Some(sync_core::data_hash(&json!({"n": 1})));
        let result = compute_reconnect_result(&store, &request);
        assert_eq!(result, ReconnectResult::Current { version: 3 });
    }

    #[test]
    fn handle_reconnect_batches_independent_results() {
        let store = EntityStateStore::new(OperationLogConfig::default());
        let a = EntityRef::new("Post", "1");
        store.emit(&a, json!({"n": 1}));
        let b = EntityRef::new("Post", "2");

        let ack = handle_reconnect(
            &store,
            &[req_with_id("s1", &a, 1), req_with_id("s2", &b, 0)],
            "r1".to_string(),
            DEFAULT_RECONNECT_TIMEOUT,
        );
        match ack {
            ServerMessage::ReconnectAck { results, .. } => {
                assert_eq!(results.get("s1"), Some(&ReconnectResult::Current { version: 1 }));
            },
            other => panic!("expected ReconnectAck, got {other:?}"),
        }
    }
}
