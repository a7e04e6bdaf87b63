//! Connection handshake coordinator.
//!
//! Drives one connection attempt through the phases in [`Phase`]:
//!
//! ```text
//! both:       ConnectionReady ->            <- ConnectionReady
//! initiator:  NoiseHandshake1 ->
//! responder:                                <- NoiseHandshake2
//! initiator:  NoiseHandshake3 ->
//! both:       wait for the peer key to be published, then
//!             Contact (sealed) ->           <- Contact (sealed)
//! ```
//!
//! The link may reorder and duplicate messages. A message that arrives
//! before its phase is buffered and replayed once the phase comes up; a
//! byte-identical copy of a message already handled is ignored. Anything
//! else out of order is fatal.
//!
//! The peer can finish first and start sending `Data` before its contact
//! card reaches us. Such frames are held, not rejected, and handed back by
//! [`HandshakeCoordinator::take_early_data`] once the card has been opened,
//! so the card's nonce is consumed before any later one.
//!
//! The outcome is reported exactly once through the completion callback,
//! except on cancellation, which reports nothing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_common::{constant_time_eq, key_fingerprint, now_millis};
use tether_core::{Envelope, MessageKind};
use tether_crypto::{Role, SessionError};

use crate::config::{CoordinatorConfig, LocalIdentity};
use crate::contact::ContactCard;
use crate::error::{CoordinatorError, ManagerError};
use crate::manager::{SessionManager, SharedSession};
use crate::phase::{accepting_phase, Phase};
use crate::retry::{poll_with_backoff, PollError};
use crate::traits::{Collaborators, CompletionCallback, PeerContact};

struct Pending {
    envelope: Envelope,
    raw: Bytes,
}

pub struct HandshakeCoordinator {
    role: Role,
    local: LocalIdentity,
    config: CoordinatorConfig,
    sessions: Arc<SessionManager>,
    collaborators: Collaborators,
    phase: Phase,
    remote_peer_id: Option<String>,
    /// Messages that arrived before their accepting phase.
    pending: VecDeque<Pending>,
    /// Raw bytes of the last message handled per kind, for duplicate detection.
    accepted: HashMap<MessageKind, Bytes>,
    remote_static: Option<[u8; 32]>,
    handshake_hash: Option<[u8; 32]>,
    contact: Option<PeerContact>,
    early_data: Vec<Envelope>,
    cancel_token: CancellationToken,
    callback: Mutex<Option<CompletionCallback>>,
}

impl HandshakeCoordinator {
    pub fn new(
        role: Role,
        local: LocalIdentity,
        config: CoordinatorConfig,
        sessions: Arc<SessionManager>,
        collaborators: Collaborators,
        on_complete: CompletionCallback,
    ) -> Self {
        Self {
            role,
            local,
            config,
            sessions,
            collaborators,
            phase: Phase::Idle,
            remote_peer_id: None,
            pending: VecDeque::new(),
            accepted: HashMap::new(),
            remote_static: None,
            handshake_hash: None,
            contact: None,
            early_data: Vec::new(),
            cancel_token: CancellationToken::new(),
            callback: Mutex::new(Some(on_complete)),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn remote_peer_id(&self) -> Option<&str> {
        self.remote_peer_id.as_deref()
    }

    pub fn contact(&self) -> Option<&PeerContact> {
        self.contact.as_ref()
    }

    /// Number of early messages waiting for their phase.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// `Data` envelopes from the peer that arrived before the handshake
    /// completed, in arrival order. Decrypt them before anything read later.
    pub fn take_early_data(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.early_data)
    }

    /// Token that cancels this coordinator when triggered, including while
    /// it waits for the peer key.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Announce readiness to the peer.
    pub async fn start(&mut self) -> Result<(), CoordinatorError> {
        self.ensure_active().await?;
        if self.phase != Phase::Idle {
            return Err(CoordinatorError::InvalidTransition {
                from: self.phase,
                to: Phase::ReadySent,
            });
        }
        info!(role = %self.role, peer = %self.local.peer_id, "starting handshake");
        let result = self.begin().await;
        self.settle(result).await
    }

    /// Feed one raw envelope from the link.
    ///
    /// After the coordinator has finished, further input is refused with
    /// [`CoordinatorError::Closed`] and nothing is reported.
    pub async fn process(&mut self, raw: &[u8]) -> Result<(), CoordinatorError> {
        self.ensure_active().await?;
        let result = self.ingest(raw).await;
        self.settle(result).await
    }

    /// Start if needed, then read `inbound` until the handshake finishes,
    /// the configured timeout passes, or the coordinator is cancelled.
    ///
    /// Messages queued behind the final contact card stay in `inbound`.
    pub async fn run(
        &mut self,
        inbound: &mut mpsc::Receiver<Bytes>,
    ) -> Result<PeerContact, CoordinatorError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let token = self.cancel_token.clone();

        if self.phase == Phase::Idle {
            self.start().await?;
        }

        while !self.phase.is_terminal() {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                received = tokio::time::timeout_at(deadline, inbound.recv()) => Some(received),
            };

            match next {
                None => {
                    self.cancel().await;
                    return Err(CoordinatorError::Cancelled);
                }
                Some(Err(_elapsed)) => {
                    let err = CoordinatorError::Timeout(self.phase);
                    self.fail(err.clone()).await;
                    return Err(err);
                }
                Some(Ok(None)) => {
                    let err = CoordinatorError::TransportClosed;
                    self.fail(err.clone()).await;
                    return Err(err);
                }
                Some(Ok(Some(raw))) => self.process(&raw).await?,
            }
        }

        match self.phase {
            Phase::Complete => self
                .contact
                .clone()
                .ok_or(CoordinatorError::Closed(Phase::Complete)),
            Phase::Cancelled => Err(CoordinatorError::Cancelled),
            phase => Err(CoordinatorError::Closed(phase)),
        }
    }

    /// Abandon the attempt. The session is destroyed and the completion
    /// callback is dropped without being called. No-op once finished.
    pub async fn cancel(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.cancel_token.cancel();
        drop(self.take_callback());

        let from = self.phase;
        self.phase = Phase::Cancelled;
        self.pending.clear();
        if let Some(peer) = self.remote_peer_id.as_deref() {
            self.sessions.remove_session(peer).await;
        }
        info!(role = %self.role, from = %from, "handshake cancelled");
    }

    async fn ensure_active(&mut self) -> Result<(), CoordinatorError> {
        if self.phase.is_terminal() {
            return Err(CoordinatorError::Closed(self.phase));
        }
        if self.cancel_token.is_cancelled() {
            self.cancel().await;
            return Err(CoordinatorError::Cancelled);
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), CoordinatorError> {
        self.send(MessageKind::ConnectionReady, Bytes::new()).await?;
        self.advance(Phase::ReadySent)?;
        self.drain().await
    }

    async fn ingest(&mut self, raw: &[u8]) -> Result<(), CoordinatorError> {
        let envelope =
            Envelope::decode(raw).map_err(|e| CoordinatorError::Malformed(e.to_string()))?;
        self.dispatch(envelope, Bytes::copy_from_slice(raw)).await?;
        self.drain().await
    }

    /// Replay buffered messages whose phase has come up, until none is left
    /// or the coordinator finishes.
    async fn drain(&mut self) -> Result<(), CoordinatorError> {
        loop {
            if self.phase.is_terminal() {
                return Ok(());
            }
            let (role, phase) = (self.role, self.phase);
            let ready = self.pending.iter().position(|p| {
                accepting_phase(p.envelope.kind, role).map_or(true, |accepting| accepting <= phase)
            });
            let Some(pending) = ready.and_then(|index| self.pending.remove(index)) else {
                return Ok(());
            };
            self.dispatch(pending.envelope, pending.raw).await?;
        }
    }

    /// Buffer, handle, ignore or reject one message depending on how its
    /// accepting phase compares with the current phase.
    async fn dispatch(&mut self, envelope: Envelope, raw: Bytes) -> Result<(), CoordinatorError> {
        self.check_sender(&envelope)?;
        let kind = envelope.kind;
        let accepting = accepting_phase(kind, self.role).ok_or(CoordinatorError::UnexpectedMessage {
            kind,
            phase: self.phase,
        })?;

        if self.phase < accepting {
            if self.pending.iter().any(|p| p.raw == raw) {
                debug!(%kind, "dropping duplicate of buffered message");
                return Ok(());
            }
            if self.pending.len() >= self.config.max_buffered_messages {
                return Err(CoordinatorError::BufferOverflow(self.config.max_buffered_messages));
            }
            debug!(%kind, phase = %self.phase, "buffering early message");
            self.pending.push_back(Pending { envelope, raw });
            return Ok(());
        }

        if self.phase > accepting {
            if self.accepted.get(&kind) == Some(&raw) {
                debug!(%kind, phase = %self.phase, "ignoring duplicate message");
                return Ok(());
            }
            return Err(CoordinatorError::UnexpectedMessage {
                kind,
                phase: self.phase,
            });
        }

        self.handle(envelope).await?;
        self.accepted.insert(kind, raw);
        Ok(())
    }

    fn check_sender(&self, envelope: &Envelope) -> Result<(), CoordinatorError> {
        let expected = self
            .remote_peer_id
            .as_deref()
            .or(self.config.expected_peer_id.as_deref());
        match expected {
            Some(expected) if expected != envelope.peer_id => Err(CoordinatorError::UnexpectedPeer {
                expected: expected.to_string(),
                actual: envelope.peer_id.clone(),
            }),
            _ => Ok(()),
        }
    }

    async fn handle(&mut self, envelope: Envelope) -> Result<(), CoordinatorError> {
        match envelope.kind {
            MessageKind::ConnectionReady => self.on_ready(envelope.peer_id).await,
            MessageKind::NoiseHandshake1
            | MessageKind::NoiseHandshake2
            | MessageKind::NoiseHandshake3 => self.on_noise(envelope.kind, &envelope.payload).await,
            MessageKind::Contact => self.on_contact(&envelope.payload).await,
            // Held in the buffer until completion, never handled here.
            MessageKind::Data => Err(CoordinatorError::UnexpectedMessage {
                kind: MessageKind::Data,
                phase: self.phase,
            }),
        }
    }

    async fn on_ready(&mut self, peer_id: String) -> Result<(), CoordinatorError> {
        let session = self.sessions.create_session(&peer_id, self.role).await?;
        info!(peer = %peer_id, role = %self.role, "peer ready");
        self.remote_peer_id = Some(peer_id);
        self.advance(Phase::ReadyExchanged)?;

        if self.role == Role::Initiator {
            let message_a = session.write().await.start_handshake()?;
            self.send(MessageKind::NoiseHandshake1, Bytes::from(message_a))
                .await?;
            self.advance(Phase::NoiseHandshake1Sent)?;
        }
        Ok(())
    }

    async fn on_noise(&mut self, kind: MessageKind, payload: &[u8]) -> Result<(), CoordinatorError> {
        let session = self.current_session().await?;
        let reply = session.write().await.process_handshake_message(payload)?;

        match (kind, reply) {
            (MessageKind::NoiseHandshake1, Some(message_b)) => {
                self.advance(Phase::NoiseHandshake1Sent)?;
                self.send(MessageKind::NoiseHandshake2, Bytes::from(message_b))
                    .await?;
                self.advance(Phase::NoiseHandshake2Sent)
            }
            (MessageKind::NoiseHandshake2, Some(message_c)) => {
                self.advance(Phase::NoiseHandshake2Sent)?;
                self.send(MessageKind::NoiseHandshake3, Bytes::from(message_c))
                    .await?;
                self.advance(Phase::NoiseHandshakeComplete)?;
                self.confirm_peer(&session).await
            }
            (MessageKind::NoiseHandshake3, None) => {
                self.advance(Phase::NoiseHandshakeComplete)?;
                self.confirm_peer(&session).await
            }
            (kind, _) => Err(SessionError::InvalidState(format!(
                "unexpected handshake output after {}",
                kind
            ))
            .into()),
        }
    }

    /// Wait for the rest of the system to publish the peer's static key,
    /// check it against the Noise-authenticated one, then send our card.
    async fn confirm_peer(&mut self, session: &SharedSession) -> Result<(), CoordinatorError> {
        let (noise_key, hash) = {
            let guard = session.read().await;
            let key = guard
                .remote_static_public_key()
                .ok_or(SessionError::NotEstablished)?;
            let hash = guard.handshake_hash().ok_or(SessionError::NotEstablished)?;
            (key, hash)
        };

        let peer = self.remote()?.to_string();
        let store = Arc::clone(&self.collaborators.key_store);
        let polled = poll_with_backoff(&self.config.key_retry, &self.cancel_token, |attempt| {
            let store = Arc::clone(&store);
            let peer = peer.clone();
            async move {
                let key = store.static_key(&peer).await;
                if key.is_none() {
                    debug!(peer = %peer, attempt, "peer key not yet visible");
                }
                key
            }
        })
        .await;

        let (published, attempts) = match polled {
            Ok(found) => found,
            Err(PollError::Cancelled) => return Err(CoordinatorError::Cancelled),
            Err(PollError::Exhausted { attempts, elapsed }) => {
                return Err(CoordinatorError::KeyUnavailable {
                    attempts,
                    elapsed_ms: elapsed.as_millis() as u64,
                })
            }
        };
        if !constant_time_eq(&published, &noise_key) {
            return Err(CoordinatorError::KeyMismatch);
        }

        info!(
            peer = %peer,
            attempts,
            key = %key_fingerprint(&noise_key),
            "peer key confirmed"
        );
        self.remote_static = Some(noise_key);
        self.handshake_hash = Some(hash);
        self.advance(Phase::PeerKeyConfirmed)?;

        let card = ContactCard::new(self.local.peer_id.as_str(), self.local.display_name.as_str());
        let sealed = card.seal(&*session.read().await)?;
        self.send(MessageKind::Contact, Bytes::from(sealed)).await?;
        self.advance(Phase::ContactSent)
    }

    async fn on_contact(&mut self, payload: &[u8]) -> Result<(), CoordinatorError> {
        let session = self.current_session().await?;
        let card = ContactCard::open(&*session.read().await, payload)?;

        let peer = self.remote()?.to_string();
        if card.peer_id != peer {
            return Err(CoordinatorError::UnexpectedPeer {
                expected: peer,
                actual: card.peer_id,
            });
        }
        let (static_public_key, handshake_hash) = match (self.remote_static, self.handshake_hash) {
            (Some(key), Some(hash)) => (key, hash),
            _ => {
                return Err(CoordinatorError::InvalidTransition {
                    from: self.phase,
                    to: Phase::Complete,
                })
            }
        };

        let identities = &self.collaborators.identities;
        identities
            .save_identity(&card.peer_id, &card.display_name)
            .await
            .map_err(CoordinatorError::collaborator)?;
        identities
            .record_session_established(&card.peer_id, &static_public_key)
            .await
            .map_err(CoordinatorError::collaborator)?;
        self.collaborators
            .queue
            .flush_peer(&card.peer_id)
            .await
            .map_err(CoordinatorError::collaborator)?;

        self.advance(Phase::Complete)?;
        let contact = PeerContact {
            peer_id: card.peer_id,
            display_name: card.display_name,
            static_public_key,
            handshake_hash,
        };
        info!(
            peer = %contact.peer_id,
            name = %contact.display_name,
            role = %self.role,
            "handshake complete"
        );
        self.keep_early_data(&peer);
        self.contact = Some(contact.clone());
        self.report(Ok(contact));
        Ok(())
    }

    fn keep_early_data(&mut self, peer: &str) {
        for Pending { envelope, .. } in self.pending.drain(..) {
            if envelope.kind == MessageKind::Data && envelope.peer_id == peer {
                self.early_data.push(envelope);
            } else {
                debug!(kind = %envelope.kind, from = %envelope.peer_id, "discarding leftover message");
            }
        }
        if !self.early_data.is_empty() {
            debug!(count = self.early_data.len(), "holding early data for caller");
        }
    }

    async fn send(&self, kind: MessageKind, payload: Bytes) -> Result<(), CoordinatorError> {
        let envelope = Envelope::new(kind, self.local.peer_id.clone(), payload, now_millis());
        let raw = envelope
            .encode()
            .map_err(|e| CoordinatorError::Malformed(e.to_string()))?;
        self.collaborators.transport.send_message(raw).await?;
        debug!(%kind, role = %self.role, "sent");
        Ok(())
    }

    fn advance(&mut self, to: Phase) -> Result<(), CoordinatorError> {
        if to.predecessor() != Some(self.phase) {
            return Err(CoordinatorError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        debug!(role = %self.role, from = %self.phase, to = %to, "phase transition");
        self.phase = to;
        Ok(())
    }

    fn remote(&self) -> Result<&str, CoordinatorError> {
        self.remote_peer_id
            .as_deref()
            .ok_or_else(|| ManagerError::UnknownPeer("(remote not yet known)".into()).into())
    }

    async fn current_session(&self) -> Result<SharedSession, CoordinatorError> {
        let peer = self.remote()?;
        self.sessions
            .session(peer)
            .await
            .ok_or_else(|| ManagerError::UnknownPeer(peer.to_string()).into())
    }

    async fn settle(&mut self, result: Result<(), CoordinatorError>) -> Result<(), CoordinatorError> {
        match result {
            Ok(()) => Ok(()),
            Err(CoordinatorError::Cancelled) => {
                self.cancel().await;
                Err(CoordinatorError::Cancelled)
            }
            Err(err) => {
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    async fn fail(&mut self, err: CoordinatorError) {
        warn!(
            role = %self.role,
            phase = %self.phase,
            kind = ?err.kind(),
            error = %err,
            "handshake failed"
        );
        self.phase = Phase::Failed;
        self.pending.clear();
        if let Some(peer) = self.remote_peer_id.as_deref() {
            self.sessions.remove_session(peer).await;
        }
        self.report(Err(err));
    }

    fn take_callback(&mut self) -> Option<CompletionCallback> {
        self.callback
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn report(&mut self, result: Result<PeerContact, CoordinatorError>) {
        if let Some(callback) = self.take_callback() {
            callback(result);
        }
    }
}
