//! Subscription registry (spec §4.6, component C6): the client-side mirror
//! of which subscriptions exist, their last version and data hash. This is
//! the counterpart to the server-side [`crate::fanout::FanoutEngine`] — it
//! lives wherever the transport's inbound frames are decoded, tracking what
//! the local caller has already been shown so [`crate::reconnect`] results
//! can be applied without re-fetching everything from scratch.
use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use parking_lot::Mutex;
use serde_json::Value;
use sync_types::{
    EntityRef,
    ErrorPayload,
    FieldSelector,
    ReconnectResult,
    ReconnectSubscriptionRequest,
    SubscriptionId,
};

/// Callback interface a caller registers per subscription. Mirrors the
/// "lazy sequence with cancel" abstraction the source exposes (spec §9):
/// at most one terminal event (`on_error` or `on_complete`) is ever
/// delivered, and no `on_next` follows a terminal event.
pub trait SubscriptionObserver: Send + Sync {
    fn on_next(&self, data: &Value);
    fn on_error(&self, error: &ErrorPayload);
    fn on_complete(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Reconnecting,
    Error,
}

struct ClientSubscription {
    entity: EntityRef,
    fields: FieldSelector,
    version: u64,
    data: Option<Value>,
    data_hash: Option<String>,
    state: SubscriptionState,
    terminal: bool,
    observer: Arc<dyn SubscriptionObserver>,
}

/// A new subscription to register, before any data has been delivered.
pub struct NewSubscription {
    pub id: SubscriptionId,
    pub entity: EntityRef,
    pub fields: FieldSelector,
    pub observer: Arc<dyn SubscriptionObserver>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub reconnecting: usize,
    pub error: usize,
}

/// Client-side subscription bookkeeping. Indexed by subscription id and by
/// entity key (spec §4.6).
#[derive(Default)]
pub struct SubscriptionRegistry {
    by_id: Mutex<HashMap<SubscriptionId, ClientSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sub` with state `pending` and, if `initial_data` is
    /// given, its hash precomputed (spec §4.6 `add`).
    pub fn add(&self, sub: NewSubscription, initial_data: Option<Value>) {
        let data_hash = initial_data.as_ref().map(sync_core::data_hash);
        self.by_id.lock().insert(
            sub.id,
            ClientSubscription {
                entity: sub.entity,
                fields: sub.fields,
                version: 0,
                data: initial_data,
                data_hash,
                state: SubscriptionState::Pending,
                terminal: false,
                observer: sub.observer,
            },
        );
    }

    pub fn remove(&self, id: &SubscriptionId) {
        self.by_id.lock().remove(id);
    }

    /// Advances `id` to `version`, replacing its data (if given) and
    /// promoting `pending`/`reconnecting` subscriptions to `active`. Fires
    /// `on_next` after the state transition has been committed.
    pub fn update_version(&self, id: &SubscriptionId, version: u64, data: Option<Value>) {
        let next = {
            let mut subs = self.by_id.lock();
            let Some(sub) = subs.get_mut(id) else {
                return;
            };
            if sub.terminal {
                return;
            }
            sub.version = version;
            if let Some(data) = data {
                sub.data_hash = Some(sync_core::data_hash(&data));
                sub.data = Some(data);
            }
            if matches!(
                sub.state,
                SubscriptionState::Pending | SubscriptionState::Reconnecting
            ) {
                sub.state = SubscriptionState::Active;
            }
            (sub.observer.clone(), sub.data.clone())
        };
        if let (observer, Some(data)) = next {
            notify_next(&observer, &data);
        }
    }

    /// On transport disconnect: every `active` subscription becomes
    /// `reconnecting` (spec §4.6 `markAllReconnecting`).
    pub fn mark_all_reconnecting(&self) {
        let mut subs = self.by_id.lock();
        for sub in subs.values_mut() {
            if sub.state == SubscriptionState::Active {
                sub.state = SubscriptionState::Reconnecting;
            }
        }
    }

    /// The payload for the reconnect protocol (spec §4.8): every
    /// subscription not already in a terminal `error` state.
    pub fn get_all_for_reconnect(&self) -> Vec<ReconnectSubscriptionRequest> {
        self.by_id
            .lock()
            .iter()
            .filter(|(_, sub)| sub.state != SubscriptionState::Error)
            .map(|(id, sub)| ReconnectSubscriptionRequest {
                id: id.clone(),
                entity: sub.entity.entity_type.clone(),
                entity_id: sub.entity.entity_id.clone(),
                fields: Some(sub.fields.clone()),
                version: sub.version,
                data_hash: sub.data_hash.clone(),
            })
            .collect()
    }

    /// Applies one [`ReconnectResult`] to the subscription it answers for
    /// (spec §4.8): the registry's state is updated first, then the
    /// observer is notified, so a throwing observer never leaves the
    /// registry half-updated.
    pub fn process_reconnect_result(&self, id: &SubscriptionId, result: &ReconnectResult) {
        enum Notification {
            Next(Value),
            Error(ErrorPayload),
            Complete,
            None,
        }

        let (observer, notification) = {
            let mut subs = self.by_id.lock();
            let Some(sub) = subs.get_mut(id) else {
                return;
            };
            if sub.terminal {
                return;
            }
            let notification = match result {
                ReconnectResult::Current { version } => {
                    sub.version = *version;
                    sub.state = SubscriptionState::Active;
                    Notification::None
                },
                ReconnectResult::Patched { version, patches } => {
                    let mut data = sub.data.clone().unwrap_or(Value::Null);
                    let mut apply_failed = None;
                    for patch in patches {
                        match sync_core::apply_patch(&data, patch) {
                            Ok(next) => data = next,
                            Err(e) => {
                                apply_failed = Some(e.to_string());
                                break;
                            },
                        }
                    }
                    match apply_failed {
                        Some(msg) => {
                            sub.state = SubscriptionState::Error;
                            sub.terminal = true;
                            Notification::Error(ErrorPayload {
                                code: "patch_application_error".to_string(),
                                message: msg,
                            })
                        },
                        None => {
                            sub.version = *version;
                            sub.data_hash = Some(sync_core::data_hash(&data));
                            sub.data = Some(data.clone());
                            sub.state = SubscriptionState::Active;
                            Notification::Next(data)
                        },
                    }
                },
                ReconnectResult::Snapshot {
                    version,
                    data,
                    data_hash,
                } => {
                    sub.version = *version;
                    sub.data = Some(data.clone());
                    sub.data_hash = Some(data_hash.clone());
                    sub.state = SubscriptionState::Active;
                    Notification::Next(data.clone())
                },
                ReconnectResult::Deleted { .. } => {
                    sub.terminal = true;
                    Notification::Complete
                },
                ReconnectResult::Error { error } => {
                    sub.state = SubscriptionState::Error;
                    sub.terminal = true;
                    Notification::Error(ErrorPayload {
                        code: "internal_error".to_string(),
                        message: error.clone(),
                    })
                },
            };
            (sub.observer.clone(), notification)
        };

        match notification {
            Notification::Next(data) => notify_next(&observer, &data),
            Notification::Error(err) => notify_error(&observer, &err),
            Notification::Complete => notify_complete(&observer),
            Notification::None => {},
        }
    }

    /// Drops every subscription, client or server initiated.
    pub fn clear(&self) {
        self.by_id.lock().clear();
    }

    /// Drops only subscriptions that reached the `error` state.
    pub fn clear_errors(&self) {
        self.by_id
            .lock()
            .retain(|_, sub| sub.state != SubscriptionState::Error);
    }

    pub fn get_stats(&self) -> RegistryStats {
        let subs = self.by_id.lock();
        let mut stats = RegistryStats {
            total: subs.len(),
            ..Default::default()
        };
        for sub in subs.values() {
            match sub.state {
                SubscriptionState::Pending => stats.pending += 1,
                SubscriptionState::Active => stats.active += 1,
                SubscriptionState::Reconnecting => stats.reconnecting += 1,
                SubscriptionState::Error => stats.error += 1,
            }
        }
        stats
    }

    #[cfg(test)]
    fn state_of(&self, id: &SubscriptionId) -> Option<SubscriptionState> {
        self.by_id.lock().get(id).map(|s| s.state)
    }
}

/// Observer calls run outside the registry's lock, but a panicking observer
/// must not be allowed to poison it or abort the caller (spec §4.6 failure
/// semantics): catch the unwind and log it.
fn notify_next(observer: &Arc<dyn SubscriptionObserver>, data: &Value) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_next(data))).is_err() {
        tracing::error!("subscription observer panicked in on_next");
    }
}

fn notify_error(observer: &Arc<dyn SubscriptionObserver>, error: &ErrorPayload) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_error(error))).is_err() {
        tracing::error!("subscription observer panicked in on_error");
    }
}

fn notify_complete(observer: &Arc<dyn SubscriptionObserver>) {
    if std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_complete())).is_err() {
        tracing::error!("subscription observer panicked in on_complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingObserver {
        next: StdMutex<Vec<Value>>,
        errors: StdMutex<Vec<ErrorPayload>>,
        completed: StdMutex<bool>,
    }

    impl SubscriptionObserver for RecordingObserver {
        fn on_next(&self, data: &Value) {
            self.next.lock().unwrap().push(data.clone());
        }

        fn on_error(&self, error: &ErrorPayload) {
            self.errors.lock().unwrap().push(error.clone());
        }

        fn on_complete(&self) {
            *self.completed.lock().unwrap() = true;
        }
    }

    fn sub(id: &str, observer: Arc<RecordingObserver>) -> NewSubscription {
        NewSubscription {
            id: id.to_string(),
            entity: EntityRef::new("Post", "1"),
            fields: FieldSelector::all(),
            observer,
        }
    }

    #[test]
    fn add_starts_pending() {
        let registry = SubscriptionRegistry::new();
        registry.add(sub("s1", Arc::new(RecordingObserver::default())), None);
        assert_eq!(registry.state_of(&"s1".to_string()), Some(SubscriptionState::Pending));
    }

    #[test]
    fn update_version_promotes_to_active_and_notifies() {
        let registry = SubscriptionRegistry::new();
        let observer = Arc::new(RecordingObserver::default());
        registry.add(sub("s1", observer.clone()), None);
        registry.update_version(&"s1".to_string(), 1, Some(json!({"title": "A"})));
        assert_eq!(registry.state_of(&"s1".to_string()), Some(SubscriptionState::Active));
        assert_eq!(observer.next.lock().unwrap().as_slice(), &[json!({"title": "A"})]);
    }

    #[test]
    fn disconnect_then_reconnecting_round_trip() {
        let registry = SubscriptionRegistry::new();
        let observer = Arc::new(RecordingObserver::default());
        registry.add(sub("s1", observer.clone()), None);
        registry.update_version(&"s1".to_string(), 1, Some(json!({"n": 1})));
        registry.mark_all_reconnecting();
        assert_eq!(
            registry.state_of(&"s1".to_string()),
            Some(SubscriptionState::Reconnecting)
        );

        let pending = registry.get_all_for_reconnect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].version, 1);

        registry.process_reconnect_result(&"s1".to_string(), &ReconnectResult::Current { version: 1 });
        assert_eq!(registry.state_of(&"s1".to_string()), Some(SubscriptionState::Active));
    }

    #[test]
    fn patched_reconnect_applies_patches_in_order() {
        let registry = SubscriptionRegistry::new();
        let observer = Arc::new(RecordingObserver::default());
        registry.add(sub("s1", observer.clone()), Some(json!({"n": 1})));
        registry.mark_all_reconnecting();

        let patch1 = vec![PatchOp::replace("/n", json!(2))];
        let patch2 = vec![PatchOp::replace("/n", json!(3))];
        registry.process_reconnect_result(
            &"s1".to_string(),
            &ReconnectResult::Patched {
                version: 3,
                patches: vec![patch1, patch2],
            },
        );

        assert_eq!(observer.next.lock().unwrap().last(), Some(&json!({"n": 3})));
        assert_eq!(registry.state_of(&"s1".to_string()), Some(SubscriptionState::Active));
    }

    #[test]
    fn deleted_reconnect_completes_and_goes_terminal() {
        let registry = SubscriptionRegistry::new();
        let observer = Arc::new(RecordingObserver::default());
        registry.add(sub("s1", observer.clone()), Some(json!({"n": 1})));
        registry.process_reconnect_result(&"s1".to_string(), &ReconnectResult::Deleted { version: 0 });
        assert!(*observer.completed.lock().unwrap());
        // terminal: a subsequent update is a no-op.
        registry.update_version(&"s1".to_string(), 5, Some(json!({"n": 99})));
        assert_eq!(observer.next.lock().unwrap().len(), 0);
    }

    #[test]
    fn clear_errors_keeps_healthy_subscriptions() {
        let registry = SubscriptionRegistry::new();
        registry.add(sub("ok", Arc::new(RecordingObserver::default())), None);
        registry.add(sub("bad", Arc::new(RecordingObserver::default())), None);
        registry.process_reconnect_result(
            &"bad".to_string(),
            &ReconnectResult::Error {
                error: "boom".to_string(),
            },
        );
        registry.clear_errors();
        let stats = registry.get_stats();
        assert_eq!(stats.total, 1);
    }

    /// Minimal patch-op builder so tests don't need to spell out
    /// `json_patch::PatchOperation::Replace(ReplaceOperation { .. })`.
    struct PatchOp;
    impl PatchOp {
        fn replace(path: &str, value: Value) -> json_patch::PatchOperation {
            json_patch::PatchOperation::Replace(json_patch::ReplaceOperation {
                path: path.to_string(),
                value,
            })
        }
    }
}
