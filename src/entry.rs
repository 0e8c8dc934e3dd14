//! The storage unit: `Entry`, its LWW ordering, and the Merkle fingerprint
//! derived from it.

use crate::error::{MerkleError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MAX_KEY_BYTES: usize = 256;
pub const MAX_VALUE_BYTES: usize = 256 * 1024;

/// The LWW origin coordinate: `(timestamp_ms, node_id)`, compared
/// numerically on `timestamp_ms` first and lexically on `node_id` to break
/// ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Origin<'a> {
    pub timestamp_ms: u64,
    pub node_id: &'a str,
}

/// Either a live value or a tombstone recording a deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryValue {
    Value(String),
    Tombstone,
}

impl EntryValue {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, EntryValue::Tombstone)
    }
}

/// A stored entry: a value or tombstone stamped with its LWW coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub value: EntryValue,
    pub timestamp_ms: u64,
    pub node_id: String,
    pub seq: u64,
}

impl Entry {
    pub fn new_value(value: String, timestamp_ms: u64, node_id: String, seq: u64) -> Result<Self> {
        if value.len() > MAX_VALUE_BYTES {
            return Err(MerkleError::SizeLimit(format!(
                "value {} bytes exceeds {} byte limit",
                value.len(),
                MAX_VALUE_BYTES
            )));
        }
        Ok(Self { value: EntryValue::Value(value), timestamp_ms, node_id, seq })
    }

    pub fn new_tombstone(timestamp_ms: u64, node_id: String, seq: u64) -> Self {
        Self { value: EntryValue::Tombstone, timestamp_ms, node_id, seq }
    }

    fn origin(&self) -> Origin<'_> {
        Origin { timestamp_ms: self.timestamp_ms, node_id: &self.node_id }
    }

    /// LWW accept rule: `incoming` wins over `existing` (or there is no
    /// existing entry) iff `(ts, node_id)` is strictly greater. Identical
    /// `(ts, node_id, seq)` triples are treated as duplicates, not wins.
    pub fn wins_over(&self, existing: Option<&Entry>) -> bool {
        match existing {
            None => true,
            Some(current) => {
                if self.timestamp_ms == current.timestamp_ms
                    && self.node_id == current.node_id
                    && self.seq == current.seq
                {
                    return false;
                }
                self.origin() > current.origin()
            }
        }
    }

    /// `H(value_bytes ‖ timestamp_ms ‖ node_id ‖ tombstone_flag)`, used as
    /// the Merkle leaf fingerprint.
    pub fn fingerprint(&self, key: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        match &self.value {
            EntryValue::Value(v) => hasher.update(v.as_bytes()),
            EntryValue::Tombstone => {}
        }
        hasher.update(self.timestamp_ms.to_be_bytes());
        hasher.update(self.node_id.as_bytes());
        hasher.update([self.value.is_tombstone() as u8]);
        hasher.finalize().into()
    }
}

pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_BYTES {
        return Err(MerkleError::SizeLimit(format!(
            "key must be 1-{} bytes, got {}",
            MAX_KEY_BYTES,
            key.len()
        )));
    }
    if key.bytes().any(|b| b == 0 || (b < 0x20 && b != b'\t')) {
        return Err(MerkleError::Validation("key contains null byte or control character".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: u64, node: &str, seq: u64) -> Entry {
        Entry::new_value("v".into(), ts, node.into(), seq).unwrap()
    }

    #[test]
    fn test_higher_timestamp_wins() {
        let a = entry(100, "a", 1);
        let b = entry(200, "a", 2);
        assert!(b.wins_over(Some(&a)));
        assert!(!a.wins_over(Some(&b)));
    }

    #[test]
    fn test_tiebreak_on_node_id() {
        // Equal timestamps: lexically greater node_id wins.
        let e_b = entry(100, "b", 1);
        let e_a = entry(100, "a", 1);
        assert!(e_b.wins_over(Some(&e_a)));
        assert!(!e_a.wins_over(Some(&e_b)));
    }

    #[test]
    fn test_duplicate_triple_suppressed() {
        let e1 = entry(100, "a", 1);
        let e2 = entry(100, "a", 1);
        assert!(!e2.wins_over(Some(&e1)));
    }

    #[test]
    fn test_value_exceeds_limit() {
        let big = "x".repeat(MAX_VALUE_BYTES + 1);
        assert!(Entry::new_value(big, 1, "n".into(), 1).is_err());
    }

    #[test]
    fn test_validate_key_rejects_control_chars() {
        assert!(validate_key("bad\u{0}key").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"k".repeat(300)).is_err());
        assert!(validate_key("ok-key").is_ok());
    }
}
