//! Connection lifecycle facade: exposes only `Ready` as "connected" to
//! callers, and a cancellation token honored by every suspended
//! operation.

use crate::error::{MerkleError, Result};
use crate::transport::ConnectionState;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Wraps a transport's raw connection-state broadcast, exposing only the
/// "is the application ready to send traffic" view (`Ready`), since no
/// traffic should be claimed healthy before subscriptions are restored.
pub struct Lifecycle {
    state_rx: broadcast::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl Lifecycle {
    pub fn new(state_rx: broadcast::Receiver<ConnectionState>) -> Self {
        Self { state_rx, cancel: CancellationToken::new() }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every suspended operation observing this token; used by
    /// `disconnect()`/`dispose()`.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Waits until the connection reaches `Ready`, a timeout elapses, or
    /// the lifecycle is cancelled.
    pub async fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                recv = self.state_rx.recv() => {
                    match recv {
                        Ok(ConnectionState::Ready) => return Ok(()),
                        Ok(_) => continue,
                        Err(_) => return Err(MerkleError::Transport("connection state stream closed".into())),
                    }
                }
                _ = self.cancel.cancelled() => return Err(MerkleError::Cancelled),
                _ = &mut deadline => return Err(MerkleError::Timeout("wait_until_ready".into())),
            }
        }
    }
}
