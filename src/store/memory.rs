//! In-memory LWW storage engine, `RwLock<HashMap<String, Entry>>`
//! guarded: many short readers, few writers, never a lock held across an
//! await point.

use super::{PutOutcome, StoreEngine};
use crate::entry::Entry;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::RwLock;

/// Thread-safe in-memory engine. The primary, always-available storage
/// backend; `persistence` layers an append-only log underneath it for
/// nodes configured with `persistence_path`.
pub struct MemoryEngine {
    map: RwLock<HashMap<String, Entry>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self { map: RwLock::new(HashMap::new()) }
    }

    /// Rebuilds an engine from a sequence of entries already known to be
    /// LWW-consistent (e.g. replayed from the persistence log), applying
    /// each through the normal accept rule so replay order never matters.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Entry)>) -> Self {
        let engine = Self::new();
        for (key, entry) in entries {
            let _ = engine.put(&key, entry);
        }
        engine
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreEngine for MemoryEngine {
    fn get(&self, key: &str) -> Option<Entry> {
        let map = self.map.read().expect("storage lock poisoned");
        map.get(key).cloned()
    }

    fn put(&self, key: &str, entry: Entry) -> Result<PutOutcome> {
        let mut map = self.map.write().expect("storage lock poisoned");
        let existing = map.get(key);
        if entry.wins_over(existing) {
            map.insert(key.to_string(), entry);
            Ok(PutOutcome::Applied)
        } else {
            Ok(PutOutcome::Suppressed)
        }
    }

    fn entries(&self) -> Vec<(String, Entry)> {
        let map = self.map.read().expect("storage lock poisoned");
        map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn gc_tombstones(&self, now_ms: u64, retention_ms: u64, retained: &dyn Fn(&str) -> bool) -> usize {
        let mut map = self.map.write().expect("storage lock poisoned");
        let expired: Vec<String> = map
            .iter()
            .filter(|(key, entry)| {
                entry.value.is_tombstone()
                    && now_ms.saturating_sub(entry.timestamp_ms) >= retention_ms
                    && !retained(key)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            map.remove(key);
        }
        expired.len()
    }

    fn max_seq_for_node(&self, node_id: &str) -> u64 {
        let map = self.map.read().expect("storage lock poisoned");
        map.values().filter(|e| e.node_id == node_id).map(|e| e.seq).max().unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.map.read().expect("storage lock poisoned").len()
    }
}
