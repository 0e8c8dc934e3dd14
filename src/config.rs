//! # Configuration Management
//!
//! Loads and validates the options enumerated in the external interface
//! spec: broker connection, topic scheme, replication access, optional
//! persistence, and adaptive battery behavior. Unknown TOML keys are
//! rejected at parse time (`deny_unknown_fields`) rather than silently
//! ignored.

use crate::error::{MerkleError, Result};
use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Replication publish/subscribe gating for this node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationAccess {
    None,
    Read,
    #[default]
    ReadWrite,
}

/// Battery-adaptive behavior. Consumed by the node's power-awareness loop;
/// the engine never reads hardware sensors itself, only this struct plus
/// whatever status stream the embedder feeds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatteryConfig {
    /// Percentage below which "low battery" adaptive behavior kicks in.
    pub low_threshold: u8,
    /// Percentage below which "critical battery" behavior kicks in.
    pub critical_threshold: u8,
    /// Widen the MQTT keepalive interval under low/critical battery.
    pub adaptive_keepalive: bool,
    /// Widen the anti-entropy interval under low/critical battery.
    pub adaptive_sync: bool,
    /// Throttle non-essential ops (anti-entropy, GC) under critical battery.
    pub throttle_ops: bool,
    /// Reduce background work (outbox batching window) under low battery.
    pub reduce_background: bool,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            low_threshold: 20,
            critical_threshold: 10,
            adaptive_keepalive: true,
            adaptive_sync: true,
            throttle_ops: true,
            reduce_background: false,
        }
    }
}

/// Top-level, immutable node configuration. Constructed once at startup;
/// nothing in the engine mutates it afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub tls_enabled: bool,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub client_id: String,
    pub node_id: String,
    pub topic_prefix: String,
    pub keepalive_seconds: u64,
    pub session_expiry_seconds: u64,
    pub connection_timeout_seconds: u64,
    pub persistence_path: Option<String>,
    pub replication_access: ReplicationAccess,
    pub is_controller: bool,
    pub battery_config: BatteryConfig,
    pub anti_entropy_rate_per_sec: f64,
    pub anti_entropy_interval_seconds: u64,
    pub outbox_high_water_mark: usize,
    /// Client ids of peers to run anti-entropy rounds against. Empty means
    /// this node only keeps its own tree in sync with its store and never
    /// reconciles against anyone.
    #[serde(default)]
    pub anti_entropy_peers: Vec<String>,
}

impl std::fmt::Display for Config {
    /// Redacts credentials — secrets never appear in logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Config {{ mqtt_host: {:?}, mqtt_port: {}, tls_enabled: {}, client_id: {:?}, node_id: {:?}, topic_prefix: {:?}, is_controller: {} }}",
            self.mqtt_host, self.mqtt_port, self.tls_enabled, self.client_id, self.node_id, self.topic_prefix, self.is_controller
        )
    }
}

impl Config {
    /// Load configuration from a TOML file, layered with `MERKLE_KV_`
    /// environment overrides (double-underscore nesting, e.g.
    /// `MERKLE_KV_BATTERY_CONFIG__LOW_THRESHOLD`).
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("MERKLE_KV").separator("__"))
            .build()
            .map_err(|e| MerkleError::Validation(format!("config load: {e}")))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| MerkleError::Validation(format!("config parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Development-friendly defaults: local broker, read_write replication,
    /// no persistence, non-controller.
    pub fn default_for(node_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            tls_enabled: false,
            username: None,
            password: None,
            client_id: client_id.into(),
            node_id: node_id.into(),
            topic_prefix: "merkle_kv".to_string(),
            keepalive_seconds: 60,
            session_expiry_seconds: 24 * 3600,
            connection_timeout_seconds: 30,
            persistence_path: None,
            replication_access: ReplicationAccess::ReadWrite,
            is_controller: false,
            battery_config: BatteryConfig::default(),
            anti_entropy_rate_per_sec: 5.0,
            anti_entropy_interval_seconds: 60,
            outbox_high_water_mark: 10_000,
            anti_entropy_peers: Vec::new(),
        }
    }

    /// TLS is mandatory whenever credentials are configured, per the
    /// transport contract.
    pub fn requires_tls(&self) -> bool {
        self.tls_enabled || self.username.is_some() || self.password.is_some()
    }

    fn validate(&self) -> Result<()> {
        if self.topic_prefix.len() > 50 {
            return Err(MerkleError::Validation("topic_prefix exceeds 50 bytes".into()));
        }
        if self.client_id.is_empty() || self.client_id.len() > 128 {
            return Err(MerkleError::Validation("client_id must be 1-128 bytes".into()));
        }
        if self.node_id.is_empty() || self.node_id.len() > 128 {
            return Err(MerkleError::Validation("node_id must be 1-128 bytes".into()));
        }
        if self.anti_entropy_rate_per_sec <= 0.0 {
            return Err(MerkleError::Validation("anti_entropy_rate_per_sec must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_toml(body: &str) -> NamedTempFile {
        let mut f = NamedTempFile::with_suffix(".toml").unwrap();
        write!(f.as_file_mut(), "{body}").unwrap();
        f
    }

    #[test]
    fn test_config_load_minimal() {
        let f = write_toml(
            r#"
mqtt_host = "broker.local"
mqtt_port = 8883
tls_enabled = true
client_id = "dev1"
node_id = "n1"
topic_prefix = "merkle_kv"
keepalive_seconds = 60
session_expiry_seconds = 86400
connection_timeout_seconds = 30
replication_access = "read_write"
is_controller = false
anti_entropy_rate_per_sec = 5.0
anti_entropy_interval_seconds = 60
outbox_high_water_mark = 10000

[battery_config]
low_threshold = 20
critical_threshold = 10
adaptive_keepalive = true
adaptive_sync = true
throttle_ops = true
reduce_background = false
"#,
        );
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.mqtt_host, "broker.local");
        assert_eq!(config.replication_access, ReplicationAccess::ReadWrite);
        assert!(config.requires_tls());
    }

    #[test]
    fn test_default_does_not_require_tls() {
        let config = Config::default_for("n1", "dev1");
        assert!(!config.requires_tls());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let f = write_toml(
            r#"
mqtt_host = "broker.local"
mqtt_port = 1883
tls_enabled = false
client_id = "dev1"
node_id = "n1"
topic_prefix = "merkle_kv"
keepalive_seconds = 60
session_expiry_seconds = 86400
connection_timeout_seconds = 30
replication_access = "read_write"
is_controller = false
anti_entropy_rate_per_sec = 5.0
anti_entropy_interval_seconds = 60
outbox_high_water_mark = 10000
totally_unknown_field = 1

[battery_config]
low_threshold = 20
critical_threshold = 10
adaptive_keepalive = true
adaptive_sync = true
throttle_ops = true
reduce_background = false
"#,
        );
        assert!(Config::load(f.path()).is_err());
    }
}
