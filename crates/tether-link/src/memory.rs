//! In-process collaborators: a channel-backed transport and in-memory
//! identity and queue stores.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex};

use crate::error::TransportError;
use crate::traits::{IdentityStore, MessageQueue, Transport};

/// Sends every message into an mpsc channel, typically the peer's inbound
/// receiver.
///
/// Without a send timeout a full channel blocks the sender until the peer
/// reads; with one, a peer that stops reading fails the send.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Bytes>,
    send_timeout: Option<Duration>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            send_timeout: None,
        }
    }

    pub fn with_send_timeout(tx: mpsc::Sender<Bytes>, send_timeout: Duration) -> Self {
        Self {
            tx,
            send_timeout: Some(send_timeout),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_message(&self, message: Bytes) -> Result<(), TransportError> {
        let Some(limit) = self.send_timeout else {
            return self
                .tx
                .send(message)
                .await
                .map_err(|_| TransportError::Closed);
        };
        self.tx
            .send_timeout(message, limit)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Closed(_) => TransportError::Closed,
                SendTimeoutError::Timeout(_) => TransportError::Send(format!(
                    "peer inbound full for {} ms",
                    limit.as_millis()
                )),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub display_name: String,
    pub static_public_key: Option<[u8; 32]>,
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: Mutex<HashMap<String, StoredIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, peer_id: &str) -> Option<StoredIdentity> {
        self.identities.lock().await.get(peer_id).cloned()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn save_identity(&self, peer_id: &str, display_name: &str) -> anyhow::Result<()> {
        let mut identities = self.identities.lock().await;
        identities
            .entry(peer_id.to_string())
            .and_modify(|stored| stored.display_name = display_name.to_string())
            .or_insert_with(|| StoredIdentity {
                display_name: display_name.to_string(),
                static_public_key: None,
            });
        Ok(())
    }

    async fn record_session_established(
        &self,
        peer_id: &str,
        static_public_key: &[u8; 32],
    ) -> anyhow::Result<()> {
        let mut identities = self.identities.lock().await;
        let stored = identities
            .get_mut(peer_id)
            .ok_or_else(|| anyhow::anyhow!("no identity saved for {}", peer_id))?;
        stored.static_public_key = Some(*static_public_key);
        Ok(())
    }
}

/// Records which peers were flushed, in order.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    flushed: Mutex<Vec<String>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn flushed(&self) -> Vec<String> {
        self.flushed.lock().await.clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn flush_peer(&self, peer_id: &str) -> anyhow::Result<()> {
        self.flushed.lock().await.push(peer_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport() {
        let (tx, mut rx) = mpsc::channel(1);
        let transport = ChannelTransport::new(tx);
        transport.send_message(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"x"));

        drop(rx);
        assert_eq!(
            transport.send_message(Bytes::new()).await.unwrap_err(),
            TransportError::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_transport_send_timeout() {
        let (tx, mut rx) = mpsc::channel(1);
        let transport = ChannelTransport::with_send_timeout(tx, Duration::from_millis(50));
        transport.send_message(Bytes::from_static(b"a")).await.unwrap();

        // Nobody reads, so the second message cannot get in.
        assert_eq!(
            transport.send_message(Bytes::from_static(b"b")).await.unwrap_err(),
            TransportError::Send("peer inbound full for 50 ms".into())
        );

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        transport.send_message(Bytes::from_static(b"c")).await.unwrap();
        drop(rx);
        assert_eq!(
            transport.send_message(Bytes::new()).await.unwrap_err(),
            TransportError::Closed
        );
    }

    #[tokio::test]
    async fn test_identity_store() {
        let store = MemoryIdentityStore::new();
        assert!(store.record_session_established("bob", &[1; 32]).await.is_err());

        store.save_identity("bob", "Bob").await.unwrap();
        store.record_session_established("bob", &[1; 32]).await.unwrap();
        store.save_identity("bob", "Robert").await.unwrap();
        assert_eq!(
            store.get("bob").await,
            Some(StoredIdentity {
                display_name: "Robert".into(),
                static_public_key: Some([1; 32]),
            })
        );
    }
}
