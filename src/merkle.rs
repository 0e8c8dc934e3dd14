//! Merkle tree over the live key set: a fixed 16-ary fan-out, bucketed by
//! a stable hash of the key. Each bucket holds the sorted `(key,
//! fingerprint)` pairs routed to it; the root hash is the hash of the 16
//! bucket hashes in order. Updates are incremental — only the touched
//! bucket (and the root) are recomputed on each write, rather than
//! rebuilding the whole tree.

use crate::entry::Entry;
use crate::store::StoreEngine;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const FANOUT: usize = 16;

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn bucket_index(key: &str) -> usize {
    (fnv1a_hash(key.as_bytes()) % FANOUT as u64) as usize
}

struct Bucket {
    entries: BTreeMap<String, [u8; 32]>,
}

impl Bucket {
    fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for (key, fingerprint) in &self.entries {
            hasher.update(key.as_bytes());
            hasher.update(fingerprint);
        }
        hasher.finalize().into()
    }
}

/// A 16-bucket Merkle summary over `(key, fingerprint)` pairs.
pub struct MerkleTree {
    buckets: Vec<Mutex<Bucket>>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self { buckets: (0..FANOUT).map(|_| Mutex::new(Bucket::new())).collect() }
    }

    /// Rebuilds the whole tree from a storage snapshot. Used at startup
    /// (or after replaying the persistence log) to seed the tree; regular
    /// operation updates it incrementally via `observe`/`forget`.
    pub fn rebuild_from_store(store: &dyn StoreEngine) -> Self {
        let tree = Self::new();
        for (key, entry) in store.entries() {
            tree.observe(&key, &entry);
        }
        tree
    }

    /// Call after every accepted `put`/`put_with_reconciliation` so the
    /// tree stays in sync with the store without a full rebuild.
    pub fn observe(&self, key: &str, entry: &Entry) {
        let idx = bucket_index(key);
        let fingerprint = entry.fingerprint(key);
        let mut bucket = self.buckets[idx].lock().expect("merkle bucket lock poisoned");
        bucket.entries.insert(key.to_string(), fingerprint);
    }

    /// Call when a key is permanently removed (tombstone GC).
    pub fn forget(&self, key: &str) {
        let idx = bucket_index(key);
        let mut bucket = self.buckets[idx].lock().expect("merkle bucket lock poisoned");
        bucket.entries.remove(key);
    }

    pub fn bucket_hash(&self, idx: usize) -> [u8; 32] {
        self.buckets[idx].lock().expect("merkle bucket lock poisoned").hash()
    }

    /// The per-bucket hash list exchanged in the SYNC phase.
    pub fn branch_summary(&self) -> Vec<[u8; 32]> {
        (0..FANOUT).map(|i| self.bucket_hash(i)).collect()
    }

    pub fn root_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for hash in self.branch_summary() {
            hasher.update(hash);
        }
        hasher.finalize().into()
    }

    /// The `(key, fingerprint)` pairs in one bucket, exchanged during
    /// SYNC_KEYS once the SYNC phase finds that bucket diverges.
    pub fn bucket_entries(&self, idx: usize) -> Vec<(String, [u8; 32])> {
        self.buckets[idx]
            .lock()
            .expect("merkle bucket lock poisoned")
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn bucket_for_key(key: &str) -> usize {
        bucket_index(key)
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;

    #[test]
    fn test_identical_stores_converge_to_same_root() {
        let a = MerkleTree::new();
        let b = MerkleTree::new();
        let e1 = Entry::new_value("v1".into(), 1, "n1".into(), 1).unwrap();
        let e2 = Entry::new_value("v2".into(), 2, "n1".into(), 2).unwrap();
        a.observe("k1", &e1);
        a.observe("k2", &e2);
        // Insert in the opposite order: bucket hashing is order-independent
        // because each bucket stores a sorted map.
        b.observe("k2", &e2);
        b.observe("k1", &e1);
        assert_eq!(a.root_hash(), b.root_hash());
    }

    #[test]
    fn test_divergence_detected_in_exactly_one_bucket_pair() {
        let a = MerkleTree::new();
        let b = MerkleTree::new();
        let e1 = Entry::new_value("v1".into(), 1, "n1".into(), 1).unwrap();
        let e1b = Entry::new_value("v1-changed".into(), 2, "n1".into(), 2).unwrap();
        a.observe("k1", &e1);
        b.observe("k1", &e1b);
        assert_ne!(a.root_hash(), b.root_hash());

        let idx = MerkleTree::bucket_for_key("k1");
        assert_ne!(a.bucket_hash(idx), b.bucket_hash(idx));
    }

    #[test]
    fn test_forget_updates_root() {
        let tree = MerkleTree::new();
        let e1 = Entry::new_value("v1".into(), 1, "n1".into(), 1).unwrap();
        tree.observe("k1", &e1);
        let with_key = tree.root_hash();
        tree.forget("k1");
        let without_key = tree.root_hash();
        assert_ne!(with_key, without_key);
        assert_eq!(without_key, MerkleTree::new().root_hash());
    }
}
