//! Coordinator configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_MAX_BUFFERED_MESSAGES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Backoff used while waiting for the peer key to become visible.
    pub key_retry: RetryPolicy,
    /// Overall deadline for [`run`](crate::HandshakeCoordinator::run).
    pub handshake_timeout: Duration,
    /// Early messages held until their phase comes up.
    pub max_buffered_messages: usize,
    /// Reject a `ConnectionReady` from anyone else.
    pub expected_peer_id: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            key_retry: RetryPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_buffered_messages: DEFAULT_MAX_BUFFERED_MESSAGES,
            expected_peer_id: None,
        }
    }
}

/// How this node presents itself to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub peer_id: String,
    pub display_name: String,
}

impl LocalIdentity {
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
        }
    }
}
