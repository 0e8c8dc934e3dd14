//! MQTT transport abstraction: connection lifecycle, QoS=1 enforcement,
//! TLS, LWT, SUBACK-gated subscription restoration.

pub mod mqtt;
pub mod stub;

pub use mqtt::MqttTransport;
pub use stub::StubTransport;

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Connection lifecycle state machine. `Ready` is the only state the
/// public API reports as "connected" — it implies subscriptions have
/// been fully restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Restoring,
    Ready,
    Disconnecting,
}

/// Capability interface for the broker connection. `MqttTransport` talks
/// to a real broker via `rumqttc`; `StubTransport` is an embedded in-memory
/// double used by tests and by "broker-mode" detection when no real broker
/// is reachable, per the "external broker vs embedded stub" distinction in
/// the design notes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    /// `suppress_lwt = true` is used for a graceful shutdown so the broker
    /// never publishes the Last-Will disconnection marker.
    async fn disconnect(&self, suppress_lwt: bool) -> Result<()>;

    /// Publishes with QoS=1. `retain` must be `false` for all application
    /// payloads; only the broker-mode probe marker topic may set it.
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Broadcast of connection-state transitions. Late subscribers observe
    /// only events from the moment of subscription onward.
    fn connection_state_stream(&self) -> broadcast::Receiver<ConnectionState>;

    /// Broadcast of SUBACKs, keyed by topic, consumed by the Topic Router
    /// to implement the SUBACK barrier.
    fn on_subscribed_stream(&self) -> broadcast::Receiver<String>;

    /// Delivers inbound application messages as `(topic, payload)` pairs.
    fn inbound_stream(&self) -> broadcast::Receiver<(String, Vec<u8>)>;
}
