//! Counters for the core's internal decisions: encoder strategy choice and
//! op-log eviction. Fan-out/dispatch-level metrics live in the `sync` crate.
metrics::register_counter_vec!(
    ENCODE_STRATEGY_TOTAL,
    "sync_core_encode_strategy_total",
    "Update encodings by chosen strategy",
    &["strategy"]
);

metrics::register_counter!(
    OP_LOG_EVICTION_TOTAL,
    "sync_core_op_log_eviction_total",
    "Op-log entries evicted"
);

pub fn record_strategy(strategy: &str) {
    metrics::log_counter_with_labels(&ENCODE_STRATEGY_TOTAL, &[strategy]);
}

pub fn record_eviction() {
    metrics::log_counter(&OP_LOG_EVICTION_TOTAL);
}
