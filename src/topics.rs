//! Canonical topic derivation and validation.

use crate::error::{MerkleError, Result};

const ALLOWED_EXTRA: [char; 3] = ['_', '/', '-'];

fn valid_chars(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_alphanumeric() || ALLOWED_EXTRA.contains(&c))
}

/// Derives and validates the canonical MQTT topics for a given prefix and
/// client id.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    prefix: String,
}

impl TopicScheme {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > 50 {
            return Err(MerkleError::Validation("topic_prefix must be 1-50 bytes".into()));
        }
        if !valid_chars(&prefix) {
            return Err(MerkleError::Validation("topic_prefix has disallowed characters".into()));
        }
        Ok(Self { prefix })
    }

    pub fn cmd_topic(&self, client_id: &str) -> Result<String> {
        self.device_topic(client_id, "cmd")
    }

    pub fn res_topic(&self, client_id: &str) -> Result<String> {
        self.device_topic(client_id, "res")
    }

    pub fn replication_topic(&self) -> String {
        format!("{}/replication/events", self.prefix)
    }

    /// The sole topic permitted `retain=true`, used only to probe whether a
    /// broker is reachable in broker mode. Never carries application data.
    pub fn probe_marker_topic(&self) -> String {
        format!("{}/mode/marker", self.prefix)
    }

    /// Anti-entropy request/response topics, addressed per target client id
    /// the same way `cmd`/`res` are.
    pub fn ae_req_topic(&self, client_id: &str) -> Result<String> {
        self.device_topic(client_id, "ae/req")
    }

    pub fn ae_res_topic(&self, client_id: &str) -> Result<String> {
        self.device_topic(client_id, "ae/res")
    }

    fn device_topic(&self, client_id: &str, suffix: &str) -> Result<String> {
        validate_client_id(client_id)?;
        let topic = format!("{}/{}/{}", self.prefix, client_id, suffix);
        validate_topic(&topic)?;
        Ok(topic)
    }

    /// Extracts the `client_id` from a `{prefix}/{client_id}/cmd|res` topic,
    /// if it matches the canonical scheme.
    pub fn parse_device_topic<'a>(&self, topic: &'a str) -> Option<(&'a str, &'static str)> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        if let Some(client_id) = rest.strip_suffix("/cmd") {
            Some((client_id, "cmd"))
        } else {
            rest.strip_suffix("/res").map(|client_id| (client_id, "res"))
        }
    }
}

pub fn validate_client_id(client_id: &str) -> Result<()> {
    if client_id.is_empty() || client_id.len() > 128 {
        return Err(MerkleError::Validation("client_id must be 1-128 bytes".into()));
    }
    if !valid_chars(client_id) {
        return Err(MerkleError::Validation("client_id has disallowed characters".into()));
    }
    Ok(())
}

pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.len() > 100 {
        return Err(MerkleError::Validation("topic exceeds 100 bytes".into()));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(MerkleError::Validation("MQTT wildcards are not allowed in a topic".into()));
    }
    if !valid_chars(topic) {
        return Err(MerkleError::Validation("topic has disallowed characters".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_topics() {
        let scheme = TopicScheme::new("merkle_kv").unwrap();
        assert_eq!(scheme.cmd_topic("dev1").unwrap(), "merkle_kv/dev1/cmd");
        assert_eq!(scheme.res_topic("dev1").unwrap(), "merkle_kv/dev1/res");
        assert_eq!(scheme.replication_topic(), "merkle_kv/replication/events");
        assert_eq!(scheme.probe_marker_topic(), "merkle_kv/mode/marker");
    }

    #[test]
    fn test_wildcard_rejected() {
        assert!(validate_topic("merkle_kv/+/cmd").is_err());
        assert!(validate_topic("merkle_kv/#").is_err());
    }

    #[test]
    fn test_parse_device_topic_roundtrip() {
        let scheme = TopicScheme::new("merkle_kv").unwrap();
        let topic = scheme.cmd_topic("dev1").unwrap();
        assert_eq!(scheme.parse_device_topic(&topic), Some(("dev1", "cmd")));
    }

    #[test]
    fn test_prefix_too_long_rejected() {
        let long = "p".repeat(51);
        assert!(TopicScheme::new(long).is_err());
    }
}
