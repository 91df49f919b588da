//! The synchronization core's standing layer: the client-side subscription
//! registry (C6), the server-side fan-out engine (C7), the reconnect
//! protocol (C8), and the protocol dispatcher (C9) that pumps wire messages
//! through [`sync_core`]'s data path. `sync_core` is pure and synchronous;
//! this crate is where I/O-shaped concerns live (egress queues, background
//! eviction and heartbeat loops), per spec §5's concurrency model.
pub mod dispatcher;
pub mod fanout;
mod metrics;
pub mod reconnect;
pub mod registry;

pub use dispatcher::{
    run_cleanup_loop,
    run_heartbeat,
    EgressRegistry,
    HeartbeatSink,
    OperationCatalog,
    SyncServer,
    HEARTBEAT_INTERVAL,
};
pub use fanout::{
    filter_fields,
    FanoutEngine,
    Outbox,
};
pub use reconnect::{
    compute_reconnect_result,
    handle_reconnect,
    DEFAULT_RECONNECT_TIMEOUT,
};
pub use registry::{
    NewSubscription,
    RegistryStats,
    SubscriptionObserver,
    SubscriptionRegistry,
    SubscriptionState,
};

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
