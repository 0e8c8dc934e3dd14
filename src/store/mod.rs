//! # Storage Engine Module
//!
//! Holds the LWW entry map (`memory`) and the optional append-only
//! persistence log (`persistence`). All storage engines implement
//! `StoreEngine`, so the rest of the crate depends only on that trait.

pub mod memory;
pub mod persistence;

pub use memory::MemoryEngine;

use crate::entry::Entry;
use crate::error::Result;

/// Outcome of `put`: whether the incoming entry became the new winner or
/// was suppressed by an existing, LWW-greater entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    Suppressed,
}

/// The storage engine contract. Implementations own the in-memory map
/// exclusively; all mutation goes through these entry points.
pub trait StoreEngine: Send + Sync {
    fn get(&self, key: &str) -> Option<Entry>;

    /// Local mutation path (Command Processor). Applies LWW and, if this is
    /// a genuine new local write, is expected to trigger replication by the
    /// caller.
    fn put(&self, key: &str, entry: Entry) -> Result<PutOutcome>;

    /// Inbound replication / anti-entropy path. Identical LWW semantics to
    /// `put`, but the caller must never re-publish as a result of this
    /// apply (loop prevention).
    fn put_with_reconciliation(&self, key: &str, entry: Entry) -> Result<PutOutcome> {
        self.put(key, entry)
    }

    /// Snapshot of all live (non-expired-tombstone) entries, keyed.
    fn entries(&self) -> Vec<(String, Entry)>;

    /// Removes tombstones older than `now_ms - retention_ms`, returning the
    /// number of keys removed. A tombstone may only be collected once no
    /// pending outbound replication references it — callers must pass
    /// `retained` for keys still referenced by the outbox.
    fn gc_tombstones(&self, now_ms: u64, retention_ms: u64, retained: &dyn Fn(&str) -> bool) -> usize;

    /// The highest `seq` this engine has observed for `node_id`, used to
    /// recover the monotonic counter after a restart.
    fn max_seq_for_node(&self, node_id: &str) -> u64;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
