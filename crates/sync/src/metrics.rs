//! Counters for the standing layer: subscription churn, fan-out frames, and
//! reconnect outcomes. Encoder/op-log internals are counted in `sync_core`.
use sync_types::ReconnectResult;

metrics::register_counter!(
    SUBSCRIBE_TOTAL,
    "sync_subscribe_total",
    "Subscriptions registered with the fan-out engine"
);

metrics::register_counter!(
    UNSUBSCRIBE_TOTAL,
    "sync_unsubscribe_total",
    "Subscriptions removed from the fan-out engine"
);

metrics::register_counter_vec!(
    BROADCAST_FRAME_TOTAL,
    "sync_broadcast_frame_total",
    "Frames produced by a broadcast, by outcome",
    &["outcome"]
);

metrics::register_counter_vec!(
    RECONNECT_RESULT_TOTAL,
    "sync_reconnect_result_total",
    "Reconnect decisions, by status",
    &["status"]
);

pub fn record_subscribe() {
    metrics::log_counter(&SUBSCRIBE_TOTAL);
}

pub fn record_unsubscribe() {
    metrics::log_counter(&UNSUBSCRIBE_TOTAL);
}

pub fn record_broadcast_outcome(outcome: &str) {
    metrics::log_counter_with_labels(&BROADCAST_FRAME_TOTAL, &[outcome]);
}

pub fn record_reconnect_result(result: &ReconnectResult) {
    let status = match result {
        ReconnectResult::Current { .. } => "current",
        ReconnectResult::Patched { .. } => "patched",
        ReconnectResult::Snapshot { .. } => "snapshot",
        ReconnectResult::Deleted { .. } => "deleted",
        ReconnectResult::Error { .. } => "error",
    };
    metrics::log_counter_with_labels(&RECONNECT_RESULT_TOTAL, &[status]);
}
