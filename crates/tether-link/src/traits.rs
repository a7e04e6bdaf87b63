//! Collaborator interfaces consumed by the coordinator.
//!
//! All of them are async and `Send + Sync` so one implementation can be
//! shared between the coordinators of several peers.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CoordinatorError, TransportError};

/// Outbound half of the link to one peer.
///
/// Delivery is best effort: messages may be lost, duplicated or reordered
/// on the way. A send error is terminal for the current handshake attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, message: Bytes) -> Result<(), TransportError>;
}

/// Source of peer static keys as seen by the rest of the application.
///
/// May lag behind the handshake; `None` means "not yet known".
#[async_trait]
pub trait PeerKeyStore: Send + Sync {
    async fn static_key(&self, peer_id: &str) -> Option<[u8; 32]>;
}

/// Persistent contact records.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn save_identity(&self, peer_id: &str, display_name: &str) -> anyhow::Result<()>;

    async fn record_session_established(
        &self,
        peer_id: &str,
        static_public_key: &[u8; 32],
    ) -> anyhow::Result<()>;
}

/// Outgoing messages queued while no session existed.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Release everything queued for `peer_id`, highest priority first.
    async fn flush_peer(&self, peer_id: &str) -> anyhow::Result<()>;
}

/// The coordinator's dependencies, bundled.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub key_store: Arc<dyn PeerKeyStore>,
    pub identities: Arc<dyn IdentityStore>,
    pub queue: Arc<dyn MessageQueue>,
}

/// What a successful handshake learned about the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerContact {
    pub peer_id: String,
    pub display_name: String,
    pub static_public_key: [u8; 32],
    /// Channel-binding value; equal on both sides.
    pub handshake_hash: [u8; 32],
}

/// Fired exactly once per coordinator, unless it is cancelled.
pub type CompletionCallback = Box<dyn FnOnce(Result<PeerContact, CoordinatorError>) + Send>;
