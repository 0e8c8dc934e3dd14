//! JSON command/response frames exchanged over the command topics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_MGET_KEYS: usize = 256;
pub const MAX_MSET_PAIRS: usize = 100;
pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 512 * 1024;

/// A parsed command frame. `id` is always a client-supplied correlation
/// UUID, echoed verbatim in the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Command {
    #[serde(rename = "GET")]
    Get { id: String, key: String },
    #[serde(rename = "SET")]
    Set { id: String, key: String, value: String },
    #[serde(rename = "DEL")]
    Del { id: String, key: String },
    #[serde(rename = "INCR")]
    Incr { id: String, key: String, #[serde(default = "default_amount")] amount: i64 },
    #[serde(rename = "DECR")]
    Decr { id: String, key: String, #[serde(default = "default_amount")] amount: i64 },
    #[serde(rename = "APPEND")]
    Append { id: String, key: String, fragment: String },
    #[serde(rename = "PREPEND")]
    Prepend { id: String, key: String, fragment: String },
    #[serde(rename = "MGET")]
    MGet { id: String, keys: Vec<String> },
    #[serde(rename = "MSET")]
    MSet { id: String, pairs: HashMap<String, String> },
}

fn default_amount() -> i64 {
    1
}

impl Command {
    pub fn id(&self) -> &str {
        match self {
            Command::Get { id, .. }
            | Command::Set { id, .. }
            | Command::Del { id, .. }
            | Command::Incr { id, .. }
            | Command::Decr { id, .. }
            | Command::Append { id, .. }
            | Command::Prepend { id, .. }
            | Command::MGet { id, .. }
            | Command::MSet { id, .. } => id,
        }
    }

    /// Whether this op is a pure read, used to decide whether a
    /// replication event must be generated.
    pub fn is_read(&self) -> bool {
        matches!(self, Command::Get { .. } | Command::MGet { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// A response frame: echoes `id`, carries `status`, and an op-specific
/// `value` on success or `error`/`error_code` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u32>,
}

impl Response {
    pub fn ok(id: impl Into<String>, value: Option<serde_json::Value>) -> Self {
        Self { id: id.into(), status: Status::Ok, value, error: None, error_code: None }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>, error_code: u32) -> Self {
        Self { id: id.into(), status: Status::Error, value: None, error: Some(error.into()), error_code: Some(error_code) }
    }
}
