//! The synchronization core's data-path primitives: the update encoder
//! (C1), array differ (C2), JSON-patch applier (C3), operation log (C4) and
//! entity state store (C5). The subscription registry, fan-out engine and
//! reconnect protocol that sit on top of these live in the `sync` crate.
pub mod array_diff;
pub mod encoder;
pub mod entity_store;
pub mod hash;
mod metrics;
pub mod op_log;
pub mod patch;

pub use array_diff::{
    apply_array_diff,
    compute_array_diff,
};
pub use encoder::{
    decode,
    encode,
    DELTA_THRESHOLD,
};
pub use entity_store::{
    EmitResult,
    EntityStateStore,
};
pub use hash::data_hash;
pub use op_log::{
    LogEntry,
    OperationLog,
    OperationLogConfig,
};
pub use patch::apply_patch;
