//! Two-phase SYNC / SYNC_KEYS exchange for anti-entropy reconciliation.

use super::rate_limiter::TokenBucket;
use crate::entry::Entry;
use crate::error::{MerkleError, Result};
use crate::merkle::{MerkleTree, FANOUT};
use crate::metrics::Metrics;
use crate::replication::Applier;
use crate::store::{PutOutcome, StoreEngine};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const MAX_SYNC_MESSAGE_BYTES: usize = 512 * 1024;
const SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ROUNDS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub root_hash: [u8; 32],
    pub branch_summary: Vec<[u8; 32]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncKeysRequest {
    pub bucket_index: usize,
    pub pairs: Vec<(String, [u8; 32])>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncKeysResponse {
    /// Full entries the peer holds that are missing or stale on our side.
    pub entries: Vec<(String, Entry)>,
    /// Keys where the peer determined *we* hold the winning entry — it
    /// wants us to send them, rather than the other way around.
    pub want_from_us: Vec<String>,
    pub more_rounds: bool,
}

/// The remote half of an anti-entropy exchange. In production this is
/// implemented over the MQTT transport (request/response topics mirroring
/// the command processor's correlation scheme); tests use an in-process
/// peer wrapping another node's store directly.
#[async_trait]
pub trait AntiEntropyPeer: Send + Sync {
    async fn sync(&self) -> Result<SyncResponse>;
    async fn sync_keys(&self, request: SyncKeysRequest) -> Result<SyncKeysResponse>;
    /// Accepts entries this node determined the peer should have.
    async fn push_entries(&self, entries: Vec<(String, Entry)>) -> Result<()>;
}

/// Drives anti-entropy rounds against a single peer. Applies reconciled
/// entries exclusively via `put_with_reconciliation`, so no applied entry
/// ever triggers a new replication event (loop prevention).
pub struct AntiEntropy {
    store: Arc<dyn StoreEngine>,
    tree: Arc<MerkleTree>,
    applier: Arc<Applier>,
    rate_limiter: TokenBucket,
    metrics: Arc<Metrics>,
}

fn estimated_size(pairs: &[(String, [u8; 32])]) -> usize {
    pairs.iter().map(|(k, _)| k.len() + 32 + 16).sum::<usize>() + 64
}

impl AntiEntropy {
    pub fn new(
        store: Arc<dyn StoreEngine>,
        tree: Arc<MerkleTree>,
        applier: Arc<Applier>,
        rate_per_sec: f64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { store, tree, applier, rate_limiter: TokenBucket::new(rate_per_sec), metrics }
    }

    /// Runs one full round against `peer`: SYNC, then SYNC_KEYS for every
    /// divergent bucket, splitting bucket exchanges that would exceed the
    /// 512 KiB message cap into further rounds.
    pub async fn run_round(&self, peer: &dyn AntiEntropyPeer) -> Result<()> {
        if !self.rate_limiter.try_acquire() {
            self.metrics.anti_entropy_rate_limited.increment();
            return Err(MerkleError::RateLimited);
        }

        let local_root = self.tree.root_hash();
        let response = match tokio::time::timeout(SYNC_TIMEOUT, peer.sync()).await {
            Ok(result) => result?,
            Err(_) => {
                self.metrics.anti_entropy_timeouts.increment();
                return Err(MerkleError::Timeout("SYNC".into()));
            }
        };

        if response.root_hash == local_root {
            info!("anti-entropy round: roots match, nothing to reconcile");
            self.metrics.anti_entropy_rounds.increment();
            return Ok(());
        }

        for bucket_idx in 0..FANOUT {
            if self.tree.bucket_hash(bucket_idx) == response.branch_summary[bucket_idx] {
                continue;
            }
            self.reconcile_bucket(peer, bucket_idx).await?;
        }
        self.metrics.anti_entropy_rounds.increment();
        Ok(())
    }

    async fn reconcile_bucket(&self, peer: &dyn AntiEntropyPeer, bucket_idx: usize) -> Result<()> {
        let mut pairs = self.tree.bucket_entries(bucket_idx);

        for _round in 0..MAX_ROUNDS {
            // Pre-check the request payload against the size cap; split by
            // halving the pair list until it fits.
            let mut chunk = pairs.clone();
            while estimated_size(&chunk) > MAX_SYNC_MESSAGE_BYTES && chunk.len() > 1 {
                chunk.truncate(chunk.len() / 2);
            }

            let request = SyncKeysRequest { bucket_index: bucket_idx, pairs: chunk };
            let response = match tokio::time::timeout(SYNC_TIMEOUT, peer.sync_keys(request)).await {
                Ok(result) => result?,
                Err(_) => {
                    self.metrics.anti_entropy_timeouts.increment();
                    return Err(MerkleError::Timeout("SYNC_KEYS".into()));
                }
            };

            for (key, entry) in response.entries {
                self.apply_reconciled(&key, entry);
            }

            if !response.want_from_us.is_empty() {
                let to_send: Vec<(String, Entry)> = response
                    .want_from_us
                    .iter()
                    .filter_map(|key| self.store.get(key).map(|entry| (key.clone(), entry)))
                    .collect();
                peer.push_entries(to_send).await?;
            }

            pairs = self.tree.bucket_entries(bucket_idx);
            if !response.more_rounds {
                return Ok(());
            }
        }
        warn!("bucket {bucket_idx} did not converge within {MAX_ROUNDS} rounds");
        Ok(())
    }

    /// Only a `PutOutcome::Applied` entry may move the Merkle tree forward
    /// — a `Suppressed` (stale) entry must leave the tree exactly as it
    /// was, or the tree would fingerprint content the store never
    /// actually holds, corrupting the next round's SYNC comparison.
    fn apply_reconciled(&self, key: &str, entry: Entry) {
        match self.store.put_with_reconciliation(key, entry.clone()) {
            Ok(PutOutcome::Applied) => {
                self.tree.observe(key, &entry);
                self.metrics.anti_entropy_keys_reconciled.increment();
            }
            Ok(PutOutcome::Suppressed) => {}
            Err(e) => warn!("failed to apply reconciled entry for {key}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::store::MemoryEngine;

    /// Wraps a second node's store/tree directly, in-process — a stand-in
    /// for the MQTT request/response round trip used in production.
    struct PeerNode {
        store: Arc<dyn StoreEngine>,
        tree: Arc<MerkleTree>,
    }

    #[async_trait]
    impl AntiEntropyPeer for PeerNode {
        async fn sync(&self) -> Result<SyncResponse> {
            Ok(SyncResponse { root_hash: self.tree.root_hash(), branch_summary: self.tree.branch_summary() })
        }

        async fn sync_keys(&self, request: SyncKeysRequest) -> Result<SyncKeysResponse> {
            let mine = self.tree.bucket_entries(request.bucket_index);
            let theirs: std::collections::HashMap<_, _> = request.pairs.into_iter().collect();

            let mut entries = Vec::new();
            let mut want_from_us = Vec::new();
            for (key, fingerprint) in &mine {
                match theirs.get(key) {
                    Some(their_fp) if their_fp == fingerprint => {}
                    Some(_) => {
                        // Divergent: whichever side's entry is LWW-greater
                        // wins; determine by comparing full entries.
                        if let Some(our_entry) = self.store.get(key) {
                            entries.push((key.clone(), our_entry));
                        }
                    }
                    None => want_from_us.push(key.clone()),
                }
            }
            for key in theirs.keys() {
                if !mine.iter().any(|(k, _)| k == key) {
                    if let Some(entry) = self.store.get(key) {
                        entries.push((key.clone(), entry));
                    }
                }
            }
            Ok(SyncKeysResponse { entries, want_from_us, more_rounds: false })
        }

        async fn push_entries(&self, entries: Vec<(String, Entry)>) -> Result<()> {
            for (key, entry) in entries {
                self.tree.observe(&key, &entry);
                self.store.put_with_reconciliation(&key, entry)?;
            }
            Ok(())
        }
    }

    fn anti_entropy_with(store: Arc<dyn StoreEngine>) -> AntiEntropy {
        let tree = Arc::new(MerkleTree::rebuild_from_store(store.as_ref()));
        let applier = Arc::new(Applier::new(Arc::clone(&store), Arc::new(Metrics::new())));
        AntiEntropy::new(store, tree, applier, 100.0, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_matching_roots_skip_reconciliation() {
        let store_a: Arc<dyn StoreEngine> = Arc::new(MemoryEngine::new());
        let store_b: Arc<dyn StoreEngine> = Arc::new(MemoryEngine::new());
        let ae_a = anti_entropy_with(Arc::clone(&store_a));
        let peer = PeerNode { store: store_b, tree: Arc::new(MerkleTree::new()) };
        ae_a.run_round(&peer).await.unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_local_writes_converge_via_sync() {
        // Two nodes each holding disjoint local writes converge to the
        // same LWW-merged store after one round.
        let store_a: Arc<dyn StoreEngine> = Arc::new(MemoryEngine::new());
        store_a.put("k1", Entry::new_value("from-a".into(), 10, "a".into(), 1).unwrap()).unwrap();

        let store_b: Arc<dyn StoreEngine> = Arc::new(MemoryEngine::new());
        store_b.put("k2", Entry::new_value("from-b".into(), 20, "b".into(), 1).unwrap()).unwrap();

        let ae_a = anti_entropy_with(Arc::clone(&store_a));
        let tree_b = Arc::new(MerkleTree::rebuild_from_store(store_b.as_ref()));
        let peer = PeerNode { store: Arc::clone(&store_b), tree: tree_b };

        ae_a.run_round(&peer).await.unwrap();

        assert!(store_a.get("k1").is_some());
        assert!(store_a.get("k2").is_some());
    }

    #[tokio::test]
    async fn test_rate_limited_round_rejected() {
        let store_a: Arc<dyn StoreEngine> = Arc::new(MemoryEngine::new());
        let ae_a = anti_entropy_with(Arc::clone(&store_a));
        // Exhaust the bucket (constructed with rate=100 above is too
        // generous; build a tight one here).
        let tight_metrics = Arc::new(Metrics::new());
        let tight = AntiEntropy::new(
            Arc::clone(&store_a),
            Arc::new(MerkleTree::rebuild_from_store(store_a.as_ref())),
            Arc::new(Applier::new(Arc::clone(&store_a), Arc::new(Metrics::new()))),
            1.0,
            Arc::clone(&tight_metrics),
        );
        let peer = PeerNode { store: Arc::new(MemoryEngine::new()), tree: Arc::new(MerkleTree::new()) };
        assert!(tight.run_round(&peer).await.is_ok());
        assert!(matches!(tight.run_round(&peer).await, Err(MerkleError::RateLimited)));
        assert_eq!(tight_metrics.anti_entropy_rate_limited.get(), 1);
        let _ = ae_a;
    }

    #[tokio::test]
    async fn test_suppressed_entry_does_not_move_tree() {
        // A stale incoming entry must be rejected by the store *and* leave
        // the tree's fingerprint for that key unchanged.
        let store_a: Arc<dyn StoreEngine> = Arc::new(MemoryEngine::new());
        store_a.put("k1", Entry::new_value("fresh".into(), 100, "a".into(), 5).unwrap()).unwrap();
        let ae_a = anti_entropy_with(Arc::clone(&store_a));
        let before = ae_a.tree.root_hash();

        let stale = Entry::new_value("stale".into(), 1, "a".into(), 1).unwrap();
        ae_a.apply_reconciled("k1", stale);

        assert_eq!(store_a.get("k1").unwrap().value, crate::entry::EntryValue::Value("fresh".into()));
        assert_eq!(ae_a.tree.root_hash(), before);
        assert_eq!(ae_a.metrics.anti_entropy_keys_reconciled.get(), 0);
    }
}
