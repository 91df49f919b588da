//! Entity state store (spec §4.5, component C5): canonical current state per
//! entity, its version counter, and the emit-and-log transaction.
use std::{
    collections::HashMap,
    sync::Arc,
};

use json_patch::PatchOperation;
use parking_lot::Mutex;
use serde_json::Value;
use sync_types::EntityRef;

use crate::op_log::{
    LogEntry,
    OperationLog,
    OperationLogConfig,
};

#[derive(Debug, Clone)]
struct EntityRecord {
    data: Value,
    version: u64,
    updated_at_ms: i64,
    latest_patch: Option<Vec<PatchOperation>>,
}

/// The result of a successful [`EntityStateStore::emit`].
#[derive(Debug, Clone)]
pub struct EmitResult {
    pub version: u64,
    pub patch: Vec<PatchOperation>,
    pub data: Value,
}

/// Per-entity state plus the shared operation log it appends to.
///
/// `emit` takes each entity's own lock, so different entities emit in
/// parallel (spec §5); the lock for one key is held only across the
/// diff-and-append critical section, never across I/O.
pub struct EntityStateStore {
    op_log: Arc<OperationLog>,
    records: Mutex<HashMap<String, Arc<Mutex<Option<EntityRecord>>>>>,
}

impl EntityStateStore {
    pub fn new(op_log_config: OperationLogConfig) -> Self {
        Self {
            op_log: Arc::new(OperationLog::new(op_log_config)),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_op_log(op_log: Arc<OperationLog>) -> Self {
        Self {
            op_log,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn op_log(&self) -> &Arc<OperationLog> {
        &self.op_log
    }

    fn slot(&self, entity: &EntityRef) -> Arc<Mutex<Option<EntityRecord>>> {
        self.records
            .lock()
            .entry(entity.key())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Atomically diffs `next_data` against the stored state, bumps the
    /// version, appends the resulting patch to the op-log, and replaces the
    /// stored state — serialized per entity key (spec invariant: contiguous
    /// versions).
    pub fn emit(&self, entity: &EntityRef, next_data: Value) -> EmitResult {
        let slot = self.slot(entity);
        let mut guard = slot.lock();

        let prev_data = guard.as_ref().map(|r| r.data.clone()).unwrap_or(Value::Null);
        let patch = json_patch::diff(&prev_data, &next_data).0;
        let next_version = guard.as_ref().map(|r| r.version + 1).unwrap_or(1);
        let now = now_ms();

        self.op_log.append(LogEntry {
            entity: entity.clone(),
            version: next_version,
            timestamp_ms: now,
            patch_size: serde_json::to_vec(&patch).map(|v| v.len()).unwrap_or(0),
            patch: patch.clone(),
        });

        *guard = Some(EntityRecord {
            data: next_data.clone(),
            version: next_version,
            updated_at_ms: now,
            latest_patch: Some(patch.clone()),
        });

        EmitResult {
            version: next_version,
            patch,
            data: next_data,
        }
    }

    pub fn get_state(&self, entity: &EntityRef) -> Option<Value> {
        self.slot(entity).lock().as_ref().map(|r| r.data.clone())
    }

    pub fn get_version(&self, entity: &EntityRef) -> u64 {
        self.slot(entity).lock().as_ref().map(|r| r.version).unwrap_or(0)
    }

    pub fn get_updated_at(&self, entity: &EntityRef) -> Option<i64> {
        self.slot(entity).lock().as_ref().map(|r| r.updated_at_ms)
    }

    pub fn get_latest_patch(&self, entity: &EntityRef) -> Option<Vec<PatchOperation>> {
        self.slot(entity).lock().as_ref().and_then(|r| r.latest_patch.clone())
    }

    /// Whether `entity` has ever been emitted (used by reconnect's "deleted"
    /// branch, spec §4.8 step 1 — this store never explicitly deletes, so
    /// "deleted" here means "never seen" from the reconnect caller's view).
    pub fn exists(&self, entity: &EntityRef) -> bool {
        self.slot(entity).lock().is_some()
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
