//! Stable error taxonomy shared by every component.
//!
//! Every kind maps to a fixed numeric `error_code` so that responses and
//! logs stay stable across releases even as messages change.

use thiserror::Error;

/// Behavioral error kinds. Library code always returns one of these, never
/// a bare `anyhow::Error` — callers match on `error_code()` rather than on
/// message text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("size limit: {0}")]
    SizeLimit(String),

    #[error("authorization denied (command): {0}")]
    Authz(String),

    #[error("authorization denied (replication): {0}")]
    ReplicationAuthz(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("not found")]
    NotFound,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited")]
    RateLimited,

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("backpressure: outbox at high-water mark")]
    Backpressure,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl MerkleError {
    /// The stable numeric code exposed to clients, per the external
    /// interface's error table.
    pub fn error_code(&self) -> u32 {
        match self {
            MerkleError::Validation(_) => 100,
            MerkleError::SizeLimit(_) => 200,
            MerkleError::Authz(_) => 300,
            MerkleError::ReplicationAuthz(_) => 301,
            MerkleError::Timeout(_) => 400,
            MerkleError::NotFound => 500,
            MerkleError::Transport(_) => 600,
            MerkleError::RateLimited => 700,
            MerkleError::PayloadTooLarge(_) => 800,
            MerkleError::Backpressure => 900,
            MerkleError::Cancelled => 900,
            MerkleError::Internal(_) => 900,
        }
    }
}

pub type Result<T> = std::result::Result<T, MerkleError>;
