//! Decodes inbound replication events, deduplicates by `(node_id, seq)`,
//! and reconciles them into the store without ever publishing (loop
//! prevention).

use crate::change_event::ReplicationEvent;
use crate::error::MerkleError;
use crate::metrics::Metrics;
use crate::store::StoreEngine;
use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-origin high-watermark map used for dedup. Gaps in `seq` are
/// permitted on the receiver; only exact duplicates are rejected.
pub struct Applier {
    store: Arc<dyn StoreEngine>,
    watermarks: Mutex<HashMap<String, u64>>,
    metrics: Arc<Metrics>,
}

impl Applier {
    pub fn new(store: Arc<dyn StoreEngine>, metrics: Arc<Metrics>) -> Self {
        Self { store, watermarks: Mutex::new(HashMap::new()), metrics }
    }

    /// Applies a raw inbound replication event payload. Malformed payloads
    /// are counted and dropped; out-of-order but fresh `seq`s are applied
    /// normally (ordering across origins is LWW, not sequence order).
    pub fn apply(&self, payload: &[u8]) {
        let event = match ReplicationEvent::decode(payload) {
            Ok(event) => event,
            Err(MerkleError::PayloadTooLarge(msg)) => {
                warn!("dropping oversize inbound replication event: {msg}");
                self.metrics.replication_malformed_dropped.increment();
                return;
            }
            Err(e) => {
                warn!("dropping malformed replication event: {e}");
                self.metrics.replication_malformed_dropped.increment();
                return;
            }
        };
        self.apply_event(event);
    }

    fn apply_event(&self, event: ReplicationEvent) {
        let (node_id, seq) = event.watermark();
        {
            let mut watermarks = self.watermarks.lock().expect("watermark lock poisoned");
            let seen = watermarks.get(&node_id).copied().unwrap_or(0);
            // Per-node seq is monotonic; anything at or below the watermark
            // is a redelivery of something already applied (at-least-once
            // QoS can redeliver a prior publish after reconnect).
            if seq <= seen {
                self.metrics.replication_duplicates_suppressed.increment();
                return;
            }
            watermarks.insert(node_id.clone(), seq);
        }

        let key = event.key.clone();
        let entry = event.into_entry();
        match self.store.put_with_reconciliation(&key, entry) {
            Ok(_) => self.metrics.replication_applied.increment(),
            Err(e) => warn!("failed to reconcile replicated entry for {key}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_event::ReplicationEvent;
    use crate::entry::{Entry, EntryValue};
    use crate::store::MemoryEngine;

    fn applier() -> Applier {
        Applier::new(Arc::new(MemoryEngine::new()), Arc::new(Metrics::new()))
    }

    #[test]
    fn test_apply_is_idempotent() {
        let applier = applier();
        let entry = Entry::new_value("v".into(), 100, "n1".into(), 1).unwrap();
        let event = ReplicationEvent::from_entry("k", &entry);
        let bytes = event.encode().unwrap();

        applier.apply(&bytes);
        applier.apply(&bytes);

        assert_eq!(applier.store.get("k").unwrap().value, EntryValue::Value("v".into()));
        assert_eq!(applier.metrics.replication_applied.get(), 1);
        assert_eq!(applier.metrics.replication_duplicates_suppressed.get(), 1);
    }

    #[test]
    fn test_malformed_payload_dropped() {
        let applier = applier();
        applier.apply(b"not valid cbor");
        assert_eq!(applier.metrics.replication_malformed_dropped.get(), 1);
    }

    #[test]
    fn test_lww_ordering_under_reconciliation() {
        // Equal timestamps: lexically greater node_id wins, regardless of apply order.
        let applier = applier();
        let e1 = Entry::new_value("X".into(), 100, "b".into(), 1).unwrap();
        let e2 = Entry::new_value("Y".into(), 100, "a".into(), 1).unwrap();
        applier.apply(&ReplicationEvent::from_entry("k", &e1).encode().unwrap());
        applier.apply(&ReplicationEvent::from_entry("k", &e2).encode().unwrap());
        assert_eq!(applier.store.get("k").unwrap().value, EntryValue::Value("X".into()));
    }
}
