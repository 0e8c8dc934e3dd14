//! Durable outbox: pending replication events awaiting a QoS-1 broker ack.
//! FIFO per origin, exclusively owned by the Publisher.

use crate::change_event::ReplicationEvent;
use crate::error::{MerkleError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub event: ReplicationEvent,
    pub created_at_ms: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_millis() as u64
}

/// In-memory FIFO queue of outbox records. When the node runs with
/// persistence enabled, the caller additionally appends accepted events to
/// the `PersistenceLog` before queuing here, so a crash never loses a
/// queued-but-unacked mutation.
pub struct Outbox {
    queue: Mutex<VecDeque<OutboxRecord>>,
    high_water_mark: usize,
}

impl Outbox {
    pub fn new(high_water_mark: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), high_water_mark }
    }

    /// Enqueues an event. Fails with `Backpressure` once the outbox is at
    /// its configured high-water mark — mutations must fail loudly rather
    /// than be silently dropped.
    pub fn enqueue(&self, event: ReplicationEvent) -> Result<()> {
        let mut queue = self.queue.lock().expect("outbox lock poisoned");
        if queue.len() >= self.high_water_mark {
            return Err(MerkleError::Backpressure);
        }
        queue.push_back(OutboxRecord { event, created_at_ms: now_ms(), attempts: 0, last_error: None });
        Ok(())
    }

    /// A snapshot of records ready to (re)attempt, oldest first, preserving
    /// per-origin FIFO order since the queue itself is never reordered.
    pub fn pending(&self) -> Vec<OutboxRecord> {
        let queue = self.queue.lock().expect("outbox lock poisoned");
        queue.iter().cloned().collect()
    }

    /// Removes the record matching `(node_id, seq)` after a successful
    /// QoS-1 ack.
    pub fn ack(&self, node_id: &str, seq: u64) {
        let mut queue = self.queue.lock().expect("outbox lock poisoned");
        queue.retain(|record| !(record.event.node_id == node_id && record.event.seq == seq));
    }

    /// Records a failed publish attempt so the flusher can apply backoff;
    /// the record itself stays in the queue for the next retry.
    pub fn record_failure(&self, node_id: &str, seq: u64, error: String) {
        let mut queue = self.queue.lock().expect("outbox lock poisoned");
        if let Some(record) = queue
            .iter_mut()
            .find(|r| r.event.node_id == node_id && r.event.seq == seq)
        {
            record.attempts += 1;
            record.last_error = Some(error);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("outbox lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a key is still referenced by a queued (un-acked) event —
    /// consulted by tombstone GC so it never collects a tombstone the
    /// outbox still needs to deliver.
    pub fn references_key(&self, key: &str) -> bool {
        let queue = self.queue.lock().expect("outbox lock poisoned");
        queue.iter().any(|r| r.event.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;

    fn event(key: &str, seq: u64) -> ReplicationEvent {
        let entry = Entry::new_value("v".into(), 1, "n1".into(), seq).unwrap();
        ReplicationEvent::from_entry(key, &entry)
    }

    #[test]
    fn test_enqueue_and_ack_fifo() {
        let outbox = Outbox::new(10);
        outbox.enqueue(event("a", 1)).unwrap();
        outbox.enqueue(event("b", 2)).unwrap();
        assert_eq!(outbox.len(), 2);
        outbox.ack("n1", 1);
        let pending = outbox.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.key, "b");
    }

    #[test]
    fn test_backpressure_at_high_water_mark() {
        let outbox = Outbox::new(1);
        outbox.enqueue(event("a", 1)).unwrap();
        assert!(matches!(outbox.enqueue(event("b", 2)), Err(MerkleError::Backpressure)));
    }

    #[test]
    fn test_references_key_for_gc() {
        let outbox = Outbox::new(10);
        outbox.enqueue(event("a", 1)).unwrap();
        assert!(outbox.references_key("a"));
        outbox.ack("n1", 1);
        assert!(!outbox.references_key("a"));
    }
}
