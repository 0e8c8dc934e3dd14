//! Embedded in-memory transport double. Used by tests and by
//! embedded/offline deployments that never talk to a real broker.

use super::{ConnectionState, Transport};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::broadcast;

pub struct StubTransport {
    state_tx: broadcast::Sender<ConnectionState>,
    suback_tx: broadcast::Sender<String>,
    inbound_tx: broadcast::Sender<(String, Vec<u8>)>,
    published: Mutex<Vec<(String, Vec<u8>, bool)>>,
    subscriptions: Mutex<Vec<String>>,
}

impl StubTransport {
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(64);
        let (suback_tx, _) = broadcast::channel(64);
        let (inbound_tx, _) = broadcast::channel(64);
        Self {
            state_tx,
            suback_tx,
            inbound_tx,
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>, bool)> {
        self.published.lock().expect("stub transport lock poisoned").clone()
    }

    /// Test hook simulating an inbound message arriving on `topic`.
    pub fn deliver(&self, topic: &str, payload: Vec<u8>) {
        let _ = self.inbound_tx.send((topic.to_string(), payload));
    }
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn connect(&self) -> Result<()> {
        let _ = self.state_tx.send(ConnectionState::Connecting);
        let _ = self.state_tx.send(ConnectionState::Connected);
        let _ = self.state_tx.send(ConnectionState::Ready);
        Ok(())
    }

    async fn disconnect(&self, _suppress_lwt: bool) -> Result<()> {
        let _ = self.state_tx.send(ConnectionState::Disconnecting);
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.published
            .lock()
            .expect("stub transport lock poisoned")
            .push((topic.to_string(), payload, retain));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.lock().expect("stub transport lock poisoned").push(topic.to_string());
        let _ = self.suback_tx.send(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions
            .lock()
            .expect("stub transport lock poisoned")
            .retain(|t| t != topic);
        Ok(())
    }

    fn connection_state_stream(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn on_subscribed_stream(&self) -> broadcast::Receiver<String> {
        self.suback_tx.subscribe()
    }

    fn inbound_stream(&self) -> broadcast::Receiver<(String, Vec<u8>)> {
        self.inbound_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_records_payload() {
        let transport = StubTransport::new();
        transport.publish("t/1", b"hello".to_vec(), false).await.unwrap();
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "t/1");
        assert!(!published[0].2);
    }

    #[tokio::test]
    async fn test_subscribe_emits_suback() {
        let transport = StubTransport::new();
        let mut subacks = transport.on_subscribed_stream();
        transport.subscribe("t/1").await.unwrap();
        let topic = subacks.recv().await.unwrap();
        assert_eq!(topic, "t/1");
    }
}
