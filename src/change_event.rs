//! The wire form of a mutation shipped over the replication bus: a CBOR
//! map with deterministic field order `{key, node_id, seq, timestamp_ms,
//! tombstone, value?}`. `value` is omitted whenever
//! `tombstone` is true.

use crate::entry::{Entry, EntryValue};
use crate::error::{MerkleError, Result};
use serde::{Deserialize, Serialize};

pub const MAX_EVENT_BYTES: usize = 300 * 1024;

/// A single replicated mutation. Field order matters for deterministic
/// encoding, so this struct's field declaration order is the wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub key: String,
    pub node_id: String,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub tombstone: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ReplicationEvent {
    pub fn from_entry(key: &str, entry: &Entry) -> Self {
        let (tombstone, value) = match &entry.value {
            EntryValue::Value(v) => (false, Some(v.clone())),
            EntryValue::Tombstone => (true, None),
        };
        Self {
            key: key.to_string(),
            node_id: entry.node_id.clone(),
            seq: entry.seq,
            timestamp_ms: entry.timestamp_ms,
            tombstone,
            value,
        }
    }

    pub fn into_entry(self) -> Entry {
        let value = if self.tombstone {
            EntryValue::Tombstone
        } else {
            EntryValue::Value(self.value.unwrap_or_default())
        };
        Entry { value, timestamp_ms: self.timestamp_ms, node_id: self.node_id, seq: self.seq }
    }

    /// Encodes to CBOR, enforcing the 300 KiB size cap. Oversize events are
    /// the Publisher's responsibility to drop (see `replication::publisher`).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_cbor::to_vec(self)
            .map_err(|e| MerkleError::Internal(format!("encode replication event: {e}")))?;
        if bytes.len() > MAX_EVENT_BYTES {
            return Err(MerkleError::PayloadTooLarge(format!(
                "replication event {} bytes exceeds {} byte cap",
                bytes.len(),
                MAX_EVENT_BYTES
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_EVENT_BYTES {
            return Err(MerkleError::PayloadTooLarge("replication event exceeds size cap".into()));
        }
        serde_cbor::from_slice(bytes)
            .map_err(|e| MerkleError::Validation(format!("malformed replication event: {e}")))
    }

    /// The `(node_id, seq)` pair used for at-least-once dedup.
    pub fn watermark(&self) -> (String, u64) {
        (self.node_id.clone(), self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_roundtrip_via_entry() {
        let entry = Entry::new_value("v1".into(), 100, "n1".into(), 1).unwrap();
        let event = ReplicationEvent::from_entry("k", &entry);
        assert_eq!(event.value.as_deref(), Some("v1"));
        assert!(!event.tombstone);

        let bytes = event.clone().encode().unwrap();
        let decoded = ReplicationEvent::decode(&bytes).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.into_entry(), entry);
    }

    #[test]
    fn test_tombstone_omits_value_field() {
        let entry = Entry::new_tombstone(100, "n1".into(), 2);
        let event = ReplicationEvent::from_entry("k", &entry);
        assert!(event.tombstone);
        assert_eq!(event.value, None);

        let bytes = serde_cbor::to_vec(&event).unwrap();
        let as_value: serde_cbor::Value = serde_cbor::from_slice(&bytes).unwrap();
        if let serde_cbor::Value::Map(map) = as_value {
            let has_value_key = map
                .keys()
                .any(|k| matches!(k, serde_cbor::Value::Text(t) if t == "value"));
            assert!(!has_value_key);
        } else {
            panic!("expected a CBOR map");
        }
    }

    #[test]
    fn test_oversize_event_rejected() {
        let big = "x".repeat(MAX_EVENT_BYTES);
        let entry = Entry::new_value(big, 1, "n1".into(), 1);
        // The value itself would already fail Entry construction at 256 KiB,
        // so build the event directly to exercise the encode-time cap.
        let event = ReplicationEvent {
            key: "k".into(),
            node_id: "n1".into(),
            seq: 1,
            timestamp_ms: 1,
            tombstone: false,
            value: Some("x".repeat(MAX_EVENT_BYTES)),
        };
        assert!(entry.is_err() || event.encode().is_err());
    }

    #[test]
    fn test_watermark() {
        let entry = Entry::new_value("v".into(), 1, "n1".into(), 42).unwrap();
        let event = ReplicationEvent::from_entry("k", &entry);
        assert_eq!(event.watermark(), ("n1".to_string(), 42));
    }
}
