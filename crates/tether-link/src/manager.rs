//! Per-peer session registry.
//!
//! `SessionManager` owns the local static key and one [`NoiseSession`] per
//! peer. It is shared by handle (`Arc<SessionManager>`) with every
//! coordinator and with whatever moves application data.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use tether_crypto::{KeyPair, NoiseSession, Role, SessionConfig};

use crate::error::ManagerError;
use crate::traits::PeerKeyStore;

pub type SharedSession = Arc<RwLock<NoiseSession>>;

pub struct SessionManager {
    local_static: KeyPair,
    config: SessionConfig,
    sessions: RwLock<HashMap<String, SharedSession>>,
}

impl SessionManager {
    pub fn new(local_static: KeyPair, config: SessionConfig) -> Self {
        Self {
            local_static,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_static_public_key(&self) -> [u8; 32] {
        *self.local_static.public_key()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a fresh session with `peer_id`, destroying any previous one.
    pub async fn create_session(&self, peer_id: &str, role: Role) -> Result<SharedSession, ManagerError> {
        let session = NoiseSession::new(role, self.local_static.clone(), &self.config)?;
        let shared = Arc::new(RwLock::new(session));

        let previous = self
            .sessions
            .write()
            .await
            .insert(peer_id.to_string(), Arc::clone(&shared));
        if let Some(previous) = previous {
            previous.write().await.destroy();
            debug!(peer = peer_id, "replaced existing session");
        }
        debug!(peer = peer_id, %role, "session created");
        Ok(shared)
    }

    pub async fn session(&self, peer_id: &str) -> Option<SharedSession> {
        self.sessions.read().await.get(peer_id).cloned()
    }

    /// Drop and destroy the session with `peer_id`. Returns whether one
    /// existed.
    pub async fn remove_session(&self, peer_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(peer_id);
        match removed {
            Some(session) => {
                session.write().await.destroy();
                debug!(peer = peer_id, "session removed");
                true
            }
            None => false,
        }
    }

    pub async fn encrypt_for(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, ManagerError> {
        let session = self
            .session(peer_id)
            .await
            .ok_or_else(|| ManagerError::UnknownPeer(peer_id.to_string()))?;
        let guard = session.read().await;
        Ok(guard.encrypt(plaintext)?)
    }

    pub async fn decrypt_from(&self, peer_id: &str, framed: &[u8]) -> Result<Vec<u8>, ManagerError> {
        let session = self
            .session(peer_id)
            .await
            .ok_or_else(|| ManagerError::UnknownPeer(peer_id.to_string()))?;
        let guard = session.read().await;
        Ok(guard.decrypt(framed)?)
    }

    /// Peer ids with a session, sorted.
    pub async fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Destroy every session.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, SharedSession)> = self.sessions.write().await.drain().collect();
        let count = drained.len();
        for (_, session) in drained {
            session.write().await.destroy();
        }
        info!(sessions = count, "session manager shut down");
    }
}

#[async_trait]
impl PeerKeyStore for SessionManager {
    /// The peer's authenticated static key, once its session is
    /// established. A session locked by a writer reads as not ready.
    async fn static_key(&self, peer_id: &str) -> Option<[u8; 32]> {
        let shared = self.session(peer_id).await?;
        let guard = shared.try_read().ok()?;
        if guard.is_established() {
            guard.remote_static_public_key()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ManagerError;
    use tether_crypto::SessionError;

    async fn handshake(a: &SessionManager, a_id: &str, b: &SessionManager, b_id: &str) {
        let sa = a.create_session(b_id, Role::Initiator).await.unwrap();
        let sb = b.create_session(a_id, Role::Responder).await.unwrap();
        let msg_a = sa.write().await.start_handshake().unwrap();
        let msg_b = sb.write().await.process_handshake_message(&msg_a).unwrap().unwrap();
        let msg_c = sa.write().await.process_handshake_message(&msg_b).unwrap().unwrap();
        sb.write().await.process_handshake_message(&msg_c).unwrap();
    }

    fn manager() -> SessionManager {
        SessionManager::new(KeyPair::generate(), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_by_peer() {
        let alice = manager();
        let bob = manager();
        handshake(&alice, "alice", &bob, "bob").await;

        let framed = alice.encrypt_for("bob", b"hi bob").await.unwrap();
        assert_eq!(bob.decrypt_from("alice", &framed).await.unwrap(), b"hi bob");
        assert_eq!(alice.peers().await, vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let alice = manager();
        assert_eq!(
            alice.encrypt_for("nobody", b"x").await.unwrap_err(),
            ManagerError::UnknownPeer("nobody".into())
        );
        assert!(!alice.remove_session("nobody").await);
    }

    #[tokio::test]
    async fn test_static_key_only_when_established() {
        let alice = manager();
        let bob = manager();
        alice.create_session("bob", Role::Initiator).await.unwrap();
        assert_eq!(alice.static_key("bob").await, None);
        assert_eq!(alice.static_key("carol").await, None);

        handshake(&alice, "alice", &bob, "bob").await;
        assert_eq!(alice.static_key("bob").await, Some(bob.local_static_public_key()));
        assert_eq!(bob.static_key("alice").await, Some(alice.local_static_public_key()));
    }

    #[tokio::test]
    async fn test_static_key_not_ready_while_locked() {
        let alice = manager();
        let bob = manager();
        handshake(&alice, "alice", &bob, "bob").await;

        let session = alice.session("bob").await.unwrap();
        let guard = session.write().await;
        assert_eq!(alice.static_key("bob").await, None);
        drop(guard);
        assert!(alice.static_key("bob").await.is_some());
    }

    #[tokio::test]
    async fn test_replacing_session_destroys_old() {
        let alice = manager();
        let old = alice.create_session("bob", Role::Initiator).await.unwrap();
        alice.create_session("bob", Role::Initiator).await.unwrap();
        assert!(old.read().await.is_destroyed());
        assert_eq!(alice.peers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_shutdown_destroy() {
        let alice = manager();
        let bob = manager();
        handshake(&alice, "alice", &bob, "bob").await;

        let session = bob.session("alice").await.unwrap();
        assert!(bob.remove_session("alice").await);
        assert!(session.read().await.is_destroyed());

        let held = alice.session("bob").await.unwrap();
        alice.shutdown().await;
        assert!(alice.peers().await.is_empty());
        assert_eq!(
            held.read().await.encrypt(b"x").unwrap_err(),
            SessionError::Destroyed
        );
    }
}
