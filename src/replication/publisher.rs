//! Turns accepted local mutations into CBOR events, queues them in a
//! durable outbox, and flushes the outbox to the replication topic with
//! QoS=1, retrying indefinitely on
//! transport failure.

use crate::change_event::ReplicationEvent;
use crate::entry::Entry;
use crate::error::MerkleError;
use crate::metrics::Metrics;
use crate::outbox::Outbox;
use crate::processor::ReplicationSink;
use crate::transport::Transport;
use log::{error, warn};
use std::sync::Arc;
use std::time::Duration;

const FLUSH_INTERVAL: Duration = Duration::from_millis(200);
const FLUSH_BATCH_SIZE: usize = 64;

pub struct Publisher {
    outbox: Arc<Outbox>,
    transport: Arc<dyn Transport>,
    topic: String,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(outbox: Arc<Outbox>, transport: Arc<dyn Transport>, topic: String, metrics: Arc<Metrics>) -> Self {
        Self { outbox, transport, topic, metrics }
    }

    /// Spawns the background flusher. Batches by size (`FLUSH_BATCH_SIZE`)
    /// and time (`FLUSH_INTERVAL`); records removed from the outbox only
    /// once the broker acks the publish.
    pub fn spawn_flusher(self: &Arc<Self>) {
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(FLUSH_INTERVAL).await;
                publisher.flush_once().await;
            }
        });
    }

    async fn flush_once(&self) {
        let pending = self.outbox.pending();
        for record in pending.into_iter().take(FLUSH_BATCH_SIZE) {
            let bytes = match record.event.encode() {
                Ok(bytes) => bytes,
                Err(_) => {
                    // Already size-checked at enqueue time; should not recur.
                    self.outbox.ack(&record.event.node_id, record.event.seq);
                    continue;
                }
            };
            match self.transport.publish(&self.topic, bytes, false).await {
                Ok(()) => {
                    self.outbox.ack(&record.event.node_id, record.event.seq);
                    self.metrics.replication_published.increment();
                }
                Err(e) => {
                    warn!("replication publish failed, will retry from outbox: {e}");
                    self.outbox.record_failure(&record.event.node_id, record.event.seq, e.to_string());
                }
            }
        }
    }
}

impl ReplicationSink for Publisher {
    fn publish_local(&self, key: &str, entry: &Entry) {
        let event = ReplicationEvent::from_entry(key, entry);
        match event.encode() {
            Ok(_) => {
                if let Err(e) = self.outbox.enqueue(event) {
                    match e {
                        MerkleError::Backpressure => {
                            error!("outbox at high-water mark, dropping replication event for {key}");
                            self.metrics.replication_backpressure_drops.increment();
                        }
                        other => error!("failed to enqueue replication event for {key}: {other}"),
                    }
                }
            }
            Err(_) => {
                // Oversize event: drop + count, local write is retained (§4.5).
                error!("replication event for {key} exceeds size cap, dropping");
                self.metrics.replication_oversize_drops.increment();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StubTransport;

    fn publisher() -> (Arc<Publisher>, Arc<StubTransport>) {
        let outbox = Arc::new(Outbox::new(10));
        let transport = Arc::new(StubTransport::new());
        let metrics = Arc::new(Metrics::new());
        let publisher = Arc::new(Publisher::new(outbox, transport.clone(), "merkle_kv/replication/events".into(), metrics));
        (publisher, transport)
    }

    #[tokio::test]
    async fn test_publish_local_enqueues_and_flushes() {
        let (publisher, transport) = publisher();
        let entry = Entry::new_value("v".into(), 1, "n1".into(), 1).unwrap();
        publisher.publish_local("k", &entry);
        assert_eq!(publisher.outbox.len(), 1);

        publisher.flush_once().await;
        assert_eq!(publisher.outbox.len(), 0);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_oversize_event_dropped_without_enqueue() {
        let (publisher, _transport) = publisher();
        // Directly construct an event whose value pushes it past the cap.
        let event = ReplicationEvent {
            key: "k".into(),
            node_id: "n1".into(),
            seq: 1,
            timestamp_ms: 1,
            tombstone: false,
            value: Some("x".repeat(crate::change_event::MAX_EVENT_BYTES)),
        };
        assert!(event.encode().is_err());
        assert_eq!(publisher.outbox.len(), 0);
    }
}
