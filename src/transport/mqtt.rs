//! Real broker transport backed by `rumqttc`.
//!
//! Connect with Clean Start=false, Keep-Alive configurable, QoS=1 for all
//! application traffic, `retain=false` except the broker-mode probe
//! marker. Reconnects with exponential backoff 1→32s ±20% jitter. TLS is
//! required whenever credentials are configured.

use super::{ConnectionState, Transport};
use crate::config::Config;
use crate::error::{MerkleError, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rand::Rng;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, TlsConfiguration, Transport as MqttTransportKind};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(32);

pub struct MqttTransport {
    client: AsyncClient,
    state_tx: broadcast::Sender<ConnectionState>,
    suback_tx: broadcast::Sender<String>,
    inbound_tx: broadcast::Sender<(String, Vec<u8>)>,
    subscriptions: Mutex<Vec<String>>,
    /// Topics awaiting their SubAck, FIFO by subscribe order. A single
    /// connection processes packets in order, so the SubAck for the Nth
    /// `SUBSCRIBE` we sent is always the Nth `SubAck` we receive — this
    /// lets us attribute each SubAck to the one topic it actually confirms
    /// instead of broadcasting every currently-tracked subscription.
    pending_acks: Mutex<VecDeque<String>>,
    suppress_lwt: Arc<AtomicBool>,
}

impl MqttTransport {
    /// Builds the transport and spawns the background event-loop poller.
    /// The loop owns reconnection, backoff with jitter, and re-subscribing
    /// to the previously-held topic set on every reconnect.
    pub fn connect_new(config: &Config) -> Result<Arc<Self>> {
        if config.requires_tls() && !config.tls_enabled {
            return Err(MerkleError::Validation(
                "credentials configured but tls_enabled is false".into(),
            ));
        }

        let mut opts = MqttOptions::new(config.client_id.clone(), config.mqtt_host.clone(), config.mqtt_port);
        opts.set_keep_alive(Duration::from_secs(config.keepalive_seconds));
        opts.set_clean_session(false);
        if config.tls_enabled {
            opts.set_transport(MqttTransportKind::Tls(TlsConfiguration::Native));
        }
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        let marker_topic = format!("{}/mode/marker", config.topic_prefix);
        opts.set_last_will(LastWill::new(
            marker_topic,
            b"disconnected".to_vec(),
            QoS::AtLeastOnce,
            false,
        ));

        let (client, eventloop) = AsyncClient::new(opts, 64);
        let (state_tx, _) = broadcast::channel(64);
        let (suback_tx, _) = broadcast::channel(64);
        let (inbound_tx, _) = broadcast::channel(256);

        let transport = Arc::new(Self {
            client,
            state_tx,
            suback_tx,
            inbound_tx,
            subscriptions: Mutex::new(Vec::new()),
            pending_acks: Mutex::new(VecDeque::new()),
            suppress_lwt: Arc::new(AtomicBool::new(false)),
        });

        tokio::spawn(Self::run_event_loop(Arc::clone(&transport), eventloop));
        Ok(transport)
    }

    async fn run_event_loop(transport: Arc<Self>, mut eventloop: rumqttc::EventLoop) {
        let mut backoff = MIN_BACKOFF;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff = MIN_BACKOFF;
                    transport.emit_state(ConnectionState::Connected);
                    transport.resubscribe_all().await;
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!("suback pkid={}", ack.pkid);
                    let acked = transport.pending_acks.lock().expect("pending acks lock poisoned").pop_front();
                    match acked {
                        Some(topic) => {
                            let _ = transport.suback_tx.send(topic);
                        }
                        None => warn!("suback pkid={} received with no pending subscription", ack.pkid),
                    }
                    transport.emit_state(ConnectionState::Ready);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = transport
                        .inbound_tx
                        .send((publish.topic.clone(), publish.payload.to_vec()));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    transport.emit_state(ConnectionState::Disconnected);
                }
                Err(e) => {
                    warn!("mqtt transport error, will reconnect: {e}");
                    transport.emit_state(ConnectionState::Disconnected);
                    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
                    let wait = backoff.mul_f64(1.0 + jitter).max(MIN_BACKOFF);
                    tokio::time::sleep(wait).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Ok(_) => {}
            }
        }
    }

    async fn resubscribe_all(&self) {
        transport_state_info("restoring subscriptions");
        self.emit_state(ConnectionState::Restoring);
        let topics = self.subscriptions.lock().expect("subscriptions lock poisoned").clone();
        for topic in topics {
            self.pending_acks.lock().expect("pending acks lock poisoned").push_back(topic.clone());
            if let Err(e) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
                error!("resubscribe to {topic} failed: {e}");
            }
        }
    }

    fn emit_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }
}

fn transport_state_info(msg: &str) {
    info!("{msg}");
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<()> {
        self.emit_state(ConnectionState::Connecting);
        Ok(())
    }

    async fn disconnect(&self, suppress_lwt: bool) -> Result<()> {
        self.suppress_lwt.store(suppress_lwt, Ordering::SeqCst);
        self.emit_state(ConnectionState::Disconnecting);
        self.client
            .disconnect()
            .await
            .map_err(|e| MerkleError::Transport(e.to_string()))?;
        self.emit_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| MerkleError::Transport(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions.lock().expect("subscriptions lock poisoned").push(topic.to_string());
        self.pending_acks.lock().expect("pending acks lock poisoned").push_back(topic.to_string());
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| MerkleError::Transport(e.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .retain(|t| t != topic);
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| MerkleError::Transport(e.to_string()))
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
