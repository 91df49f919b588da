//! Operation log (spec §4.4, component C4): a bounded, per-entity version
//! history used to serve reconnect catch-up without a full snapshot.
use std::{
    collections::{
        BTreeMap,
        VecDeque,
    },
    time::Duration,
};

use json_patch::PatchOperation;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use sync_types::EntityRef;

/// Defaults per spec §4.4.
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_MEMORY_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogConfig {
    pub max_entries: usize,
    #[serde(with = "duration_millis")]
    pub max_age: Duration,
    pub max_memory_bytes: usize,
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
}

impl Default for OperationLogConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_age: DEFAULT_MAX_AGE,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{
        Deserialize,
        Deserializer,
        Serialize,
        Serializer,
    };

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// One op-log entry (spec §3 "Patch entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub entity: EntityRef,
    /// Version produced by this patch.
    pub version: u64,
    pub timestamp_ms: i64,
    pub patch: Vec<PatchOperation>,
    pub patch_size: usize,
}

#[derive(Debug, Default)]
struct EntityIndex {
    /// Entries in increasing version order, contiguous by construction.
    entries: VecDeque<LogEntry>,
}

impl EntityIndex {
    fn oldest_version(&self) -> Option<u64> {
        self.entries.front().map(|e| e.version)
    }

    fn newest_version(&self) -> Option<u64> {
        self.entries.back().map(|e| e.version)
    }
}

pub struct OperationLog {
    config: OperationLogConfig,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    by_entity: BTreeMap<String, EntityIndex>,
    /// Global eviction order, oldest first, as `(entity_key, version)`.
    global_order: VecDeque<(String, u64)>,
    total_entries: usize,
    total_memory: usize,
}

impl OperationLog {
    pub fn new(config: OperationLogConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn config(&self) -> &OperationLogConfig {
        &self.config
    }

    /// Appends `entry`, then evicts if any configured limit is exceeded.
    pub fn append(&self, entry: LogEntry) {
        let key = entry.entity.key();
        let size = entry.patch_size;
        {
            let mut state = self.state.lock();
            state.global_order.push_back((key.clone(), entry.version));
            state.total_entries += 1;
            state.total_memory += size;
            state.by_entity.entry(key).or_default().entries.push_back(entry);
        }
        self.evict_over_limits();
    }

    /// Returns the ordered slice of entries with `version > from_version`,
    /// or `None` if the required history is no longer retained, or the
    /// resulting slice would be non-contiguous.
    pub fn get_since(&self, entity: &EntityRef, from_version: u64) -> Option<Vec<LogEntry>> {
        let state = self.state.lock();
        let index = state.by_entity.get(&entity.key())?;
        let oldest = index.oldest_version()?;
        let newest = index.newest_version()?;

        if from_version >= newest {
            return Some(Vec::new());
        }
        if from_version < oldest.saturating_sub(1) {
            return None;
        }

        let tail: Vec<LogEntry> = index
            .entries
            .iter()
            .filter(|e| e.version > from_version)
            .cloned()
            .collect();

        let mut expected = from_version + 1;
        for entry in &tail {
            if entry.version != expected {
                return None;
            }
            expected += 1;
        }
        Some(tail)
    }

    pub fn get_oldest_version(&self, entity: &EntityRef) -> Option<u64> {
        self.state.lock().by_entity.get(&entity.key())?.oldest_version()
    }

    pub fn get_newest_version(&self, entity: &EntityRef) -> Option<u64> {
        self.state.lock().by_entity.get(&entity.key())?.newest_version()
    }

    pub fn has_version(&self, entity: &EntityRef, version: u64) -> bool {
        let state = self.state.lock();
        let Some(index) = state.by_entity.get(&entity.key()) else {
            return false;
        };
        index.entries.iter().any(|e| e.version == version)
    }

    /// Eviction driver: age, then count, then memory, in that order. Safe to
    /// call on a timer (`cleanup_interval`) or inline after `append`.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();

        let cutoff_ms = now_ms() - self.config.max_age.as_millis() as i64;
        while let Some((key, version)) = state.global_order.front().cloned() {
            let too_old = state
                .by_entity
                .get(&key)
                .and_then(|idx| idx.entries.front())
                .map(|e| e.timestamp_ms < cutoff_ms)
                .unwrap_or(false);
            if !too_old {
                break;
            }
            evict_one(&mut state, &key, version);
        }

        while state.total_entries > self.config.max_entries {
            let Some((key, version)) = state.global_order.front().cloned() else {
                break;
            };
            evict_one(&mut state, &key, version);
        }

        while state.total_memory > self.config.max_memory_bytes {
            let Some((key, version)) = state.global_order.front().cloned() else {
                break;
            };
            evict_one(&mut state, &key, version);
        }
    }

    fn evict_over_limits(&self) {
        let state = self.state.lock();
        let over = state.total_entries > self.config.max_entries
            || state.total_memory > self.config.max_memory_bytes;
        drop(state);
        if over {
            self.cleanup();
        }
    }
}

fn evict_one(state: &mut State, key: &str, version: u64) {
    state.global_order.pop_front();
    if let Some(index) = state.by_entity.get_mut(key) {
        if let Some(front) = index.entries.front() {
            if front.version == version {
                let removed = index.entries.pop_front().expect("checked front above");
                state.total_entries -= 1;
                state.total_memory -= removed.patch_size;
                crate::metrics::record_eviction();
            }
        }
        if index.entries.is_empty() {
            state.by_entity.remove(key);
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
