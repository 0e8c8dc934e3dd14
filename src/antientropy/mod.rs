//! Anti-entropy: Merkle comparison followed by divergent-key exchange,
//! with rate limiting and loop prevention via `put_with_reconciliation`.

pub mod mqtt_peer;
pub mod protocol;
pub mod rate_limiter;

pub use mqtt_peer::{spawn_ae_responder, AeCorrelator, MqttPeer};
pub use protocol::{AntiEntropy, AntiEntropyPeer, SyncKeysRequest, SyncKeysResponse, SyncResponse};
pub use rate_limiter::TokenBucket;
