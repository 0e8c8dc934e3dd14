//! Public API facade: typed operations, connection-state stream, and the
//! error taxonomy — the single entry point embedders use.

use crate::antientropy::{spawn_ae_responder, AeCorrelator, AntiEntropy, AntiEntropyPeer, MqttPeer};
use crate::command::{Command, Response, Status};
use crate::config::Config;
use crate::error::{MerkleError, Result};
use crate::lifecycle::Lifecycle;
use crate::merkle::MerkleTree;
use crate::metrics::Metrics;
use crate::outbox::Outbox;
use crate::processor::CommandProcessor;
use crate::replication::{Applier, Publisher};
use crate::router::TopicRouter;
use crate::store::{persistence::PersistenceLog, MemoryEngine, StoreEngine};
use crate::topics::TopicScheme;
use crate::transport::{ConnectionState, MqttTransport, Transport};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SINGLE_KEY_TIMEOUT: Duration = Duration::from_secs(10);
const BULK_TIMEOUT: Duration = Duration::from_secs(20);

/// A running MerkleKV node: storage, replication, anti-entropy, and the
/// MQTT transport, wired together behind typed methods.
pub struct MerkleKvNode {
    config: Config,
    store: Arc<dyn StoreEngine>,
    processor: Arc<CommandProcessor>,
    router: Arc<TopicRouter>,
    transport: Arc<dyn Transport>,
    outbox: Arc<Outbox>,
    tree: Arc<MerkleTree>,
    metrics: Arc<Metrics>,
    lifecycle: Mutex<Lifecycle>,
}

impl MerkleKvNode {
    /// Builds a node against a real MQTT broker.
    pub fn connect(config: Config) -> Result<Self> {
        let transport = MqttTransport::connect_new(&config)?;
        Self::with_transport(config, transport)
    }

    /// Builds a node against any `Transport` implementation — used with
    /// `StubTransport` in tests and embedded/offline scenarios.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let persistence: Option<Arc<PersistenceLog>> = match &config.persistence_path {
            Some(path) => Some(Arc::new(PersistenceLog::open(path)?)),
            None => None,
        };
        let store: Arc<dyn StoreEngine> = match &persistence {
            Some(log) => {
                let entries = log.replay()?;
                info!("replayed {} entries from persistence log", entries.len());
                Arc::new(MemoryEngine::from_entries(entries))
            }
            None => Arc::new(MemoryEngine::new()),
        };

        let tree = Arc::new(MerkleTree::rebuild_from_store(store.as_ref()));
        let metrics = Arc::new(Metrics::new());
        let outbox = Arc::new(Outbox::new(config.outbox_high_water_mark));
        let router = Arc::new(TopicRouter::new(&config, Arc::clone(&transport))?);
        let topic_scheme = TopicScheme::new(config.topic_prefix.clone())?;

        let publisher = Arc::new(Publisher::new(
            Arc::clone(&outbox),
            Arc::clone(&transport),
            router.replication_topic(),
            Arc::clone(&metrics),
        ));
        publisher.spawn_flusher();

        let processor = Arc::new(CommandProcessor::new(
            Arc::clone(&store),
            publisher,
            config.node_id.clone(),
            Arc::clone(&metrics),
            persistence.clone(),
        ));
        let applier = Arc::new(Applier::new(Arc::clone(&store), Arc::clone(&metrics)));

        spawn_inbound_router(Arc::clone(&transport), Arc::clone(&router), Arc::clone(&processor), Arc::clone(&applier));
        spawn_tree_resync(Arc::clone(&store), Arc::clone(&tree), Duration::from_secs(config.anti_entropy_interval_seconds));
        spawn_tombstone_gc(Arc::clone(&store), Arc::clone(&outbox), Arc::clone(&tree), Arc::clone(&metrics));

        let ae_correlator = Arc::new(AeCorrelator::new());
        spawn_ae_responder(
            Arc::clone(&transport),
            topic_scheme.clone(),
            config.client_id.clone(),
            Arc::clone(&store),
            Arc::clone(&tree),
            Arc::clone(&ae_correlator),
        )?;

        if !config.anti_entropy_peers.is_empty() {
            let anti_entropy = Arc::new(AntiEntropy::new(
                Arc::clone(&store),
                Arc::clone(&tree),
                Arc::clone(&applier),
                config.anti_entropy_rate_per_sec,
                Arc::clone(&metrics),
            ));
            let peers: Vec<Arc<dyn AntiEntropyPeer>> = config
                .anti_entropy_peers
                .iter()
                .map(|peer_client_id| {
                    let peer: Arc<dyn AntiEntropyPeer> = Arc::new(MqttPeer::new(
                        Arc::clone(&transport),
                        topic_scheme.clone(),
                        peer_client_id.clone(),
                        config.client_id.clone(),
                        Arc::clone(&ae_correlator),
                    ));
                    peer
                })
                .collect();
            spawn_anti_entropy_rounds(anti_entropy, peers, Duration::from_secs(config.anti_entropy_interval_seconds));
        }

        let lifecycle = Mutex::new(Lifecycle::new(router.connection_state_stream()));
        Ok(Self { config, store, processor, router, transport, outbox, tree, metrics, lifecycle })
    }

    /// Cancellation token observed by every suspended operation; cancelled
    /// by `shutdown()` so in-flight dispatches unwind instead of hanging
    /// on a connection that's going away.
    pub async fn cancellation_token(&self) -> CancellationToken {
        self.lifecycle.lock().await.cancellation_token()
    }

    /// `connect()` in Disconnected → Connecting; broker ack → Connected;
    /// router re-subscribes → Restoring; SUBACK-for-all → Ready.
    pub async fn start(&self) -> Result<()> {
        self.transport.connect().await?;
        self.router.subscribe_and_wait_for_restore().await?;
        let timeout = Duration::from_secs(self.config.connection_timeout_seconds);
        self.lifecycle.lock().await.wait_until_ready(timeout).await
    }

    /// `disconnect()` → Disconnecting → Disconnected. Suppresses the
    /// Last-Will marker for a clean shutdown, and cancels every operation
    /// still waiting on the connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.lifecycle.lock().await.cancel_all();
        self.transport.disconnect(true).await
    }

    pub fn connection_state_stream(&self) -> tokio::sync::broadcast::Receiver<ConnectionState> {
        self.router.connection_state_stream()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    async fn dispatch_with_timeout(&self, command: Command, timeout: Duration) -> Response {
        let id = command.id().to_string();
        match tokio::time::timeout(timeout, self.run_dispatch(command)).await {
            Ok(response) => response,
            Err(_) => {
                debug!("command {id} abandoned after timeout");
                Response::err(id, "operation timed out", MerkleError::Timeout(String::new()).error_code())
            }
        }
    }

    async fn run_dispatch(&self, command: Command) -> Response {
        let processor = Arc::clone(&self.processor);
        // CPU-bound dispatch runs synchronously on the calling task; the
        // storage lock is never held across an await point.
        processor.dispatch(command)
    }

    pub async fn get(&self, key: impl Into<String>) -> Result<Option<String>> {
        let response = self
            .dispatch_with_timeout(
                Command::Get { id: Uuid::new_v4().to_string(), key: key.into() },
                SINGLE_KEY_TIMEOUT,
            )
            .await;
        match response.status {
            Status::Ok => Ok(response.value.and_then(|v| v.as_str().map(str::to_string))),
            Status::Error => {
                if response.error_code == Some(500) {
                    Ok(None)
                } else {
                    Err(response_to_error(response))
                }
            }
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let response = self
            .dispatch_with_timeout(
                Command::Set { id: Uuid::new_v4().to_string(), key: key.into(), value: value.into() },
                SINGLE_KEY_TIMEOUT,
            )
            .await;
        ok_or_error(response)
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<()> {
        let response = self
            .dispatch_with_timeout(
                Command::Del { id: Uuid::new_v4().to_string(), key: key.into() },
                SINGLE_KEY_TIMEOUT,
            )
            .await;
        ok_or_error(response)
    }

    pub async fn incr(&self, key: impl Into<String>, amount: i64) -> Result<i64> {
        let response = self
            .dispatch_with_timeout(
                Command::Incr { id: Uuid::new_v4().to_string(), key: key.into(), amount },
                SINGLE_KEY_TIMEOUT,
            )
            .await;
        value_as_i64(response)
    }

    pub async fn decr(&self, key: impl Into<String>, amount: i64) -> Result<i64> {
        let response = self
            .dispatch_with_timeout(
                Command::Decr { id: Uuid::new_v4().to_string(), key: key.into(), amount },
                SINGLE_KEY_TIMEOUT,
            )
            .await;
        value_as_i64(response)
    }

    pub async fn mget(&self, keys: Vec<String>) -> Result<serde_json::Map<String, serde_json::Value>> {
        let response = self
            .dispatch_with_timeout(Command::MGet { id: Uuid::new_v4().to_string(), keys }, BULK_TIMEOUT)
            .await;
        match response.status {
            Status::Ok => match response.value {
                Some(serde_json::Value::Object(map)) => Ok(map),
                _ => Ok(serde_json::Map::new()),
            },
            Status::Error => Err(response_to_error(response)),
        }
    }

    /// Garbage-collects expired tombstones, skipping keys still referenced
    /// by a pending outbox record. The background task spawned in
    /// `with_transport` calls this automatically every `GC_INTERVAL`; it's
    /// also exposed here for callers that want an out-of-band sweep.
    pub fn gc_tombstones(&self, now_ms: u64, retention_ms: u64) -> usize {
        collect_tombstones(&self.store, &self.outbox, &self.tree, &self.metrics, now_ms, retention_ms)
    }

    /// Publishes a command into another client's inbox, for the controller
    /// role. Denied locally (error code 300) without touching the network
    /// unless this node is configured as a controller or the target is
    /// itself.
    pub async fn publish_command_to(&self, target_client_id: &str, command: Command) -> Result<()> {
        self.router.authorize_command_publish(target_client_id)?;
        let topic = self.router.cmd_topic_for(target_client_id)?;
        let bytes = serde_json::to_vec(&command).map_err(|e| MerkleError::Internal(e.to_string()))?;
        self.transport.publish(&topic, bytes, false).await
    }
}

/// Tombstones stay visible for at least this long after their
/// `timestamp_ms` before they're eligible for collection.
const TOMBSTONE_RETENTION_MS: u64 = 24 * 3600 * 1000;
const GC_INTERVAL: Duration = Duration::from_secs(3600);

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

fn collect_tombstones(
    store: &Arc<dyn StoreEngine>,
    outbox: &Arc<Outbox>,
    tree: &Arc<MerkleTree>,
    metrics: &Arc<Metrics>,
    now_ms: u64,
    retention_ms: u64,
) -> usize {
    let removed = store.gc_tombstones(now_ms, retention_ms, &|key| outbox.references_key(key));
    if removed > 0 {
        metrics.tombstones_collected.add(removed as u64);
        for (key, entry) in store.entries() {
            tree.observe(&key, &entry);
        }
    }
    removed
}

/// Sweeps expired tombstones on an hourly timer, alongside the node's
/// other background timers (reconnect backoff, Merkle resync,
/// anti-entropy).
fn spawn_tombstone_gc(store: Arc<dyn StoreEngine>, outbox: Arc<Outbox>, tree: Arc<MerkleTree>, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(GC_INTERVAL).await;
            let removed = collect_tombstones(&store, &outbox, &tree, &metrics, now_ms(), TOMBSTONE_RETENTION_MS);
            if removed > 0 {
                debug!("garbage-collected {removed} expired tombstone(s)");
            }
        }
    });
}

fn response_to_error(response: Response) -> MerkleError {
    let message = response.error.unwrap_or_else(|| "unknown error".to_string());
    match response.error_code {
        Some(100) => MerkleError::Validation(message),
        Some(200) => MerkleError::SizeLimit(message),
        Some(300) => MerkleError::Authz(message),
        Some(301) => MerkleError::ReplicationAuthz(message),
        Some(400) => MerkleError::Timeout(message),
        Some(500) => MerkleError::NotFound,
        Some(600) => MerkleError::Transport(message),
        Some(700) => MerkleError::RateLimited,
        Some(800) => MerkleError::PayloadTooLarge(message),
        _ => MerkleError::Internal(message),
    }
}

fn ok_or_error(response: Response) -> Result<()> {
    match response.status {
        Status::Ok => Ok(()),
        Status::Error => Err(response_to_error(response)),
    }
}

fn value_as_i64(response: Response) -> Result<i64> {
    match response.status {
        Status::Ok => response
            .value
            .and_then(|v| v.as_i64())
            .ok_or_else(|| MerkleError::Internal("expected integer result".into())),
        Status::Error => Err(response_to_error(response)),
    }
}

/// Keeps the Merkle tree current between anti-entropy rounds. Local
/// writes and reconciled applies both mutate the store without touching
/// the tree directly, so a lightweight periodic rebuild closes the gap;
/// `MerkleTree::rebuild_from_store` is cheap relative to the anti-entropy
/// interval it runs against.
fn spawn_tree_resync(store: Arc<dyn StoreEngine>, tree: Arc<MerkleTree>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            for (key, entry) in store.entries() {
                tree.observe(&key, &entry);
            }
        }
    });
}

/// Runs periodic anti-entropy rounds against every configured peer, one
/// background task per peer so a slow or unreachable peer never delays
/// reconciliation with the others.
fn spawn_anti_entropy_rounds(anti_entropy: Arc<AntiEntropy>, peers: Vec<Arc<dyn AntiEntropyPeer>>, interval: Duration) {
    for peer in peers {
        let anti_entropy = Arc::clone(&anti_entropy);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = anti_entropy.run_round(peer.as_ref()).await {
                    warn!("anti-entropy round failed: {e}");
                }
            }
        });
    }
}

/// Routes inbound MQTT messages to the command processor or the
/// replication applier depending on topic. Command responses are
/// published back to this device's `res` topic.
fn spawn_inbound_router(
    transport: Arc<dyn Transport>,
    router: Arc<TopicRouter>,
    processor: Arc<CommandProcessor>,
    applier: Arc<Applier>,
) {
    let mut inbound = transport.inbound_stream();
    let replication_topic = router.replication_topic();
    tokio::spawn(async move {
        loop {
            let (topic, payload) = match inbound.recv().await {
                Ok(message) => message,
                Err(_) => break,
            };

            if topic == replication_topic {
                applier.apply(&payload);
                continue;
            }

            let cmd_topic = match router.cmd_topic() {
                Ok(t) => t,
                Err(_) => continue,
            };
            if topic != cmd_topic {
                continue;
            }

            let command: Command = match serde_json::from_slice(&payload) {
                Ok(command) => command,
                Err(e) => {
                    warn!("dropping malformed command frame: {e}");
                    continue;
                }
            };
            let response = processor.dispatch(command);
            if let Ok(res_topic) = router.res_topic() {
                if let Ok(bytes) = serde_json::to_vec(&response) {
                    if let Err(e) = transport.publish(&res_topic, bytes, false).await {
                        warn!("failed to publish command response: {e}");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StubTransport;

    fn node() -> MerkleKvNode {
        let config = Config::default_for("n1", "dev1");
        MerkleKvNode::with_transport(config, Arc::new(StubTransport::new())).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_delete_roundtrip() {
        let node = node();
        node.set("k", "v").await.unwrap();
        assert_eq!(node.get("k").await.unwrap(), Some("v".to_string()));
        node.delete("k").await.unwrap();
        assert_eq!(node.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_decr() {
        let node = node();
        assert_eq!(node.incr("ctr", 5).await.unwrap(), 5);
        assert_eq!(node.decr("ctr", 2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_start_reaches_ready() {
        let node = node();
        node.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_command_to_denied_without_controller() {
        let node = node();
        let command = Command::Get { id: "r1".into(), key: "k".into() };
        let err = node.publish_command_to("other-device", command).await.unwrap_err();
        assert_eq!(err.error_code(), 300);
    }

    #[tokio::test]
    async fn test_controller_publishes_command_to_target() {
        let mut config = Config::default_for("n1", "controller");
        config.is_controller = true;
        let transport = Arc::new(StubTransport::new());
        let node = MerkleKvNode::with_transport(config, Arc::clone(&transport)).unwrap();

        let command = Command::Get { id: "r1".into(), key: "k".into() };
        node.publish_command_to("other-device", command).await.unwrap();

        let published = transport.published();
        assert!(published.iter().any(|(topic, _, _)| topic == "merkle_kv/other-device/cmd"));
    }
}
