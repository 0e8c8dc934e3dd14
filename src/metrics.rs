//! Plain atomic counters across every subsystem, with a flat snapshot
//! accessor for embedders that want to export them.

use std::sync::atomic::{AtomicU64, Ordering};

/// A single monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// All counters exposed by the node, grouped by the subsystem that owns
/// them. Cloning a `Metrics` handle is cheap (shared via `Arc` at the call
/// sites); the struct itself holds no interior `Arc`s because every field
/// is independently atomic.
#[derive(Debug, Default)]
pub struct Metrics {
    pub commands_dispatched: Counter,
    pub commands_failed: Counter,
    pub idempotent_hits: Counter,

    pub replication_published: Counter,
    pub replication_applied: Counter,
    pub replication_duplicates_suppressed: Counter,
    pub replication_oversize_drops: Counter,
    pub replication_backpressure_drops: Counter,
    pub replication_malformed_dropped: Counter,

    pub anti_entropy_rounds: Counter,
    pub anti_entropy_rate_limited: Counter,
    pub anti_entropy_timeouts: Counter,
    pub anti_entropy_keys_reconciled: Counter,

    pub tombstones_collected: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Renders a flat `key=value` snapshot, used by the public API's
    /// diagnostic surface (not part of the replicated protocol).
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("commands_dispatched", self.commands_dispatched.get()),
            ("commands_failed", self.commands_failed.get()),
            ("idempotent_hits", self.idempotent_hits.get()),
            ("replication_published", self.replication_published.get()),
            ("replication_applied", self.replication_applied.get()),
            ("replication_duplicates_suppressed", self.replication_duplicates_suppressed.get()),
            ("replication_oversize_drops", self.replication_oversize_drops.get()),
            ("replication_backpressure_drops", self.replication_backpressure_drops.get()),
            ("replication_malformed_dropped", self.replication_malformed_dropped.get()),
            ("anti_entropy_rounds", self.anti_entropy_rounds.get()),
            ("anti_entropy_rate_limited", self.anti_entropy_rate_limited.get()),
            ("anti_entropy_timeouts", self.anti_entropy_timeouts.get()),
            ("anti_entropy_keys_reconciled", self.anti_entropy_keys_reconciled.get()),
            ("tombstones_collected", self.tombstones_collected.get()),
        ]
    }
}
