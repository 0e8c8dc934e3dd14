//! Topic router: publish/subscribe dispatch, client-side authorization
//! pre-check, and the SUBACK barrier gating "restored".

use crate::config::{Config, ReplicationAccess};
use crate::error::{MerkleError, Result};
use crate::topics::TopicScheme;
use crate::transport::{ConnectionState, Transport};
use log::info;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side authorization pre-check (fail-fast; server ACLs remain
/// authoritative). This never touches the network — a denial is decided
/// from local state alone, so a cross-client command publish always
/// fails with code 300 without hitting the network.
pub struct TopicRouter {
    scheme: TopicScheme,
    client_id: String,
    is_controller: bool,
    replication_access: ReplicationAccess,
    transport: Arc<dyn Transport>,
    restored_topics: Mutex<HashSet<String>>,
}

impl TopicRouter {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let scheme = TopicScheme::new(config.topic_prefix.clone())?;
        Ok(Self {
            scheme,
            client_id: config.client_id.clone(),
            is_controller: config.is_controller,
            replication_access: config.replication_access,
            transport,
            restored_topics: Mutex::new(HashSet::new()),
        })
    }

    /// Pre-check for publishing a command to `target_client_id`'s inbox.
    /// A non-controller may only publish to its own topic. A controller
    /// may publish to any client under the canonical prefix.
    pub fn authorize_command_publish(&self, target_client_id: &str) -> Result<()> {
        if self.is_controller || target_client_id == self.client_id {
            Ok(())
        } else {
            Err(MerkleError::Authz(format!(
                "client {} may not publish commands to {}",
                self.client_id, target_client_id
            )))
        }
    }

    /// Pre-check for publishing to the replication bus, gated by
    /// `replication_access`.
    pub fn authorize_replication_publish(&self) -> Result<()> {
        match self.replication_access {
            ReplicationAccess::ReadWrite => Ok(()),
            _ => Err(MerkleError::ReplicationAuthz(
                "replication_access does not permit publishing".into(),
            )),
        }
    }

    pub fn authorize_replication_subscribe(&self) -> Result<()> {
        match self.replication_access {
            ReplicationAccess::None => Err(MerkleError::ReplicationAuthz(
                "replication_access does not permit subscribing".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn cmd_topic(&self) -> Result<String> {
        self.scheme.cmd_topic(&self.client_id)
    }

    /// The command topic for another client, used by a controller to
    /// publish into that client's inbox once `authorize_command_publish`
    /// has cleared the request.
    pub fn cmd_topic_for(&self, client_id: &str) -> Result<String> {
        self.scheme.cmd_topic(client_id)
    }

    pub fn res_topic(&self) -> Result<String> {
        self.scheme.res_topic(&self.client_id)
    }

    pub fn replication_topic(&self) -> String {
        self.scheme.replication_topic()
    }

    /// Subscribes to this device's command topic and (if permitted) the
    /// replication bus, then blocks until every SUBACK is observed or its
    /// per-topic timeout elapses — the SUBACK barrier.
    pub async fn subscribe_and_wait_for_restore(&self) -> Result<()> {
        let mut topics = vec![self.cmd_topic()?];
        if self.authorize_replication_subscribe().is_ok() {
            topics.push(self.replication_topic());
        }

        let mut subacks = self.transport.on_subscribed_stream();
        for topic in &topics {
            self.transport.subscribe(topic).await?;
        }

        for topic in &topics {
            if self.restored_topics.lock().expect("restored topics lock poisoned").contains(topic) {
                continue;
            }
            self.wait_for_suback(&mut subacks, topic).await;
        }
        info!("subscription restoration complete for {} topic(s)", topics.len());
        Ok(())
    }

    async fn wait_for_suback(&self, subacks: &mut broadcast::Receiver<String>, topic: &str) {
        let deadline = tokio::time::sleep(SUBACK_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                recv = subacks.recv() => {
                    match recv {
                        Ok(acked) if &acked == topic => {
                            self.restored_topics.lock().expect("restored topics lock poisoned").insert(topic.to_string());
                            return;
                        }
                        Ok(_) => continue,
                        Err(_) => return,
                    }
                }
                _ = &mut deadline => {
                    log::warn!("SUBACK for {topic} timed out; proceeding without confirmation");
                    return;
                }
            }
        }
    }

    pub fn clear_restoration_state(&self) {
        self.restored_topics.lock().expect("restored topics lock poisoned").clear();
    }

    pub fn connection_state_stream(&self) -> broadcast::Receiver<ConnectionState> {
        self.transport.connection_state_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::StubTransport;

    fn router(is_controller: bool) -> TopicRouter {
        let mut config = Config::default_for("n1", "d1");
        config.is_controller = is_controller;
        TopicRouter::new(&config, Arc::new(StubTransport::new())).unwrap()
    }

    #[test]
    fn test_cross_client_denied_without_network() {
        let router = router(false);
        assert!(router.authorize_command_publish("d2").is_err());
    }

    #[test]
    fn test_controller_may_publish_to_any_client() {
        let router = router(true);
        assert!(router.authorize_command_publish("d2").is_ok());
    }

    #[test]
    fn test_self_publish_always_allowed() {
        let router = router(false);
        assert!(router.authorize_command_publish("d1").is_ok());
    }

    #[test]
    fn test_cmd_topic_for_resolves_target_client() {
        let router = router(true);
        assert_eq!(router.cmd_topic_for("d2").unwrap(), "merkle_kv/d2/cmd");
    }

    #[tokio::test]
    async fn test_subscribe_and_wait_for_restore() {
        let router = router(false);
        router.subscribe_and_wait_for_restore().await.unwrap();
    }
}
