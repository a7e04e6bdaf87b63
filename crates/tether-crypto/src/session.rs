//! Per-peer Noise session.
//!
//! A [`NoiseSession`] drives one XX handshake and, once established, frames
//! transport messages as
//!
//! ```text
//! nonce (u64, big-endian) || ciphertext || tag (16)
//! ```
//!
//! The nonce travels in the clear so the receiver can decrypt messages that
//! arrive after a gap. Received nonces go through a [`ReplayWindow`] and are
//! only recorded after the frame authenticates.
//!
//! Encryption and decryption each run under their own lock, so one session
//! can be shared between a sending task and a receiving task without two
//! encryptions ever observing the same nonce.

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};

use crate::cipher::{CipherState, TAG_LEN};
use crate::dh::{KeyPair, DH_LEN};
use crate::error::{CryptoError, ErrorKind};
use crate::handshake::{HandshakeState, HandshakeStep, Role};
use crate::replay::ReplayWindow;

pub const DEFAULT_PROLOGUE: &[u8] = b"tether-noise-v1";

/// Length of the cleartext nonce prefix.
pub const NONCE_LEN: usize = 8;

/// Bytes added to every plaintext by [`NoiseSession::encrypt`].
pub const FRAME_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Largest framed transport message.
pub const MAX_MESSAGE_LEN: usize = 65535;

/// Largest plaintext that fits in one framed message.
pub const MAX_PLAINTEXT_LEN: usize = MAX_MESSAGE_LEN - FRAME_OVERHEAD;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not established")]
    NotEstablished,

    #[error("session destroyed")]
    Destroyed,

    #[error("operation is only valid for the {expected}")]
    WrongRole { expected: Role },

    #[error("handshake already started")]
    AlreadyStarted,

    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("replayed or stale nonce {0}")]
    Replay(u64),

    #[error("message too large: {len} bytes, limit {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("session lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Replay(_) => ErrorKind::Authentication,
            SessionError::MessageTooLarge { .. } => ErrorKind::Structural,
            SessionError::Crypto(err) => err.kind(),
            _ => ErrorKind::Misuse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Replay window size; 1 accepts strictly increasing nonces only.
    pub replay_window: u64,
    /// Bound into the handshake transcript; both peers must agree.
    pub prologue: Vec<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            replay_window: ReplayWindow::DEFAULT_SIZE,
            prologue: DEFAULT_PROLOGUE.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initiator before `start_handshake`, responder before message A.
    Uninitialized,
    Handshaking,
    Established,
    /// The handshake failed; the session cannot be reused.
    Failed,
}

struct Receiver {
    cipher: CipherState,
    window: ReplayWindow,
}

pub struct NoiseSession {
    role: Role,
    state: SessionState,
    handshake: Option<HandshakeState>,
    local_static: [u8; DH_LEN],
    remote_static: Option<[u8; DH_LEN]>,
    handshake_hash: Option<[u8; 32]>,
    replay_window: u64,
    send: Mutex<Option<CipherState>>,
    recv: Mutex<Option<Receiver>>,
    destroyed: bool,
}

impl NoiseSession {
    pub fn new(role: Role, local_static: KeyPair, config: &SessionConfig) -> Result<Self, SessionError> {
        let local_public = *local_static.public_key();
        let handshake = HandshakeState::new(role, local_static, &config.prologue)?;
        Ok(Self {
            role,
            state: SessionState::Uninitialized,
            handshake: Some(handshake),
            local_static: local_public,
            remote_static: None,
            handshake_hash: None,
            replay_window: config.replay_window,
            send: Mutex::new(None),
            recv: Mutex::new(None),
            destroyed: false,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        !self.destroyed && self.state == SessionState::Established
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Produce message A. Initiator only, once.
    pub fn start_handshake(&mut self) -> Result<Vec<u8>, SessionError> {
        self.ensure_alive()?;
        if self.role != Role::Initiator {
            return Err(SessionError::WrongRole {
                expected: Role::Initiator,
            });
        }
        if self.state != SessionState::Uninitialized {
            return Err(SessionError::AlreadyStarted);
        }

        let message = self.handshake_mut()?.write_message_a()?;
        self.state = SessionState::Handshaking;
        debug!(role = %self.role, "noise handshake started");
        Ok(message)
    }

    /// Feed a peer handshake message and return our reply, if any.
    ///
    /// A message of the wrong length for the current step is rejected
    /// without changing any state.
    pub fn process_handshake_message(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>, SessionError> {
        self.ensure_alive()?;
        match self.state {
            SessionState::Established => {
                return Err(SessionError::InvalidState("handshake already complete".into()))
            }
            SessionState::Failed => {
                return Err(SessionError::InvalidState("handshake failed".into()))
            }
            SessionState::Uninitialized if self.role == Role::Initiator => {
                return Err(SessionError::InvalidState(
                    "initiator must call start_handshake first".into(),
                ))
            }
            _ => {}
        }

        let result = self.step(message);
        if let Err(err) = &result {
            if self.handshake.as_ref().map_or(false, HandshakeState::is_failed) {
                warn!(role = %self.role, error = %err, "noise handshake failed");
                self.state = SessionState::Failed;
            }
        }
        result
    }

    fn step(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>, SessionError> {
        let hs = self.handshake_mut()?;
        match hs.step() {
            HandshakeStep::ReadMessageA => {
                hs.read_message_a(message)?;
                let reply = hs.write_message_b()?;
                self.state = SessionState::Handshaking;
                Ok(Some(reply))
            }
            HandshakeStep::ReadMessageB => {
                hs.read_message_b(message)?;
                let reply = hs.write_message_c()?;
                self.finish()?;
                Ok(Some(reply))
            }
            HandshakeStep::ReadMessageC => {
                hs.read_message_c(message)?;
                self.finish()?;
                Ok(None)
            }
            other => Err(SessionError::InvalidState(format!(
                "no handshake message expected at {:?}",
                other
            ))),
        }
    }

    fn finish(&mut self) -> Result<(), SessionError> {
        let mut hs = self
            .handshake
            .take()
            .ok_or_else(|| SessionError::InvalidState("handshake missing".into()))?;
        let (send, recv) = hs.split()?;
        self.remote_static = hs.remote_static_public_key().copied();
        self.handshake_hash = Some(hs.handshake_hash());
        hs.destroy();

        self.send = Mutex::new(Some(send));
        self.recv = Mutex::new(Some(Receiver {
            cipher: recv,
            window: ReplayWindow::with_size(self.replay_window),
        }));
        self.state = SessionState::Established;
        debug!(role = %self.role, "noise session established");
        Ok(())
    }

    /// Seal `plaintext` under the next send nonce.
    ///
    /// Output is `plaintext.len() + FRAME_OVERHEAD` bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.ensure_established()?;
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(SessionError::MessageTooLarge {
                len: plaintext.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }

        let mut guard = lock(&self.send)?;
        let cipher = guard.as_mut().ok_or(SessionError::NotEstablished)?;
        let nonce = cipher.nonce();
        let sealed = cipher.encrypt_with_ad(&[], plaintext)?;

        let mut framed = Vec::with_capacity(NONCE_LEN + sealed.len());
        framed.extend_from_slice(&nonce.to_be_bytes());
        framed.extend_from_slice(&sealed);
        Ok(framed)
    }

    /// Open a framed message. Replays, stale nonces and any tampering fail.
    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.ensure_established()?;
        if framed.len() < FRAME_OVERHEAD {
            return Err(CryptoError::MessageTooShort {
                minimum: FRAME_OVERHEAD,
                actual: framed.len(),
            }
            .into());
        }
        if framed.len() > MAX_MESSAGE_LEN {
            return Err(SessionError::MessageTooLarge {
                len: framed.len(),
                max: MAX_MESSAGE_LEN,
            });
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&framed[..NONCE_LEN]);
        let nonce = u64::from_be_bytes(nonce_bytes);

        let mut guard = lock(&self.recv)?;
        let receiver = guard.as_mut().ok_or(SessionError::NotEstablished)?;
        if !receiver.window.check(nonce) {
            warn!(nonce, "rejected replayed transport message");
            return Err(SessionError::Replay(nonce));
        }

        let plaintext = receiver
            .cipher
            .decrypt_with_nonce(nonce, &[], &framed[NONCE_LEN..])
            .map_err(|err| {
                warn!(nonce, error = %err, "transport message failed authentication");
                err
            })?;
        receiver.window.accept(nonce);
        Ok(plaintext)
    }

    /// Transcript hash, once established.
    pub fn handshake_hash(&self) -> Option<[u8; 32]> {
        self.handshake_hash
    }

    /// Peer static key, once the handshake has authenticated it.
    pub fn remote_static_public_key(&self) -> Option<[u8; DH_LEN]> {
        self.remote_static.or_else(|| {
            self.handshake
                .as_ref()
                .and_then(|hs| hs.remote_static_public_key().copied())
        })
    }

    pub fn local_static_public_key(&self) -> [u8; DH_LEN] {
        self.local_static
    }

    pub fn next_send_nonce(&self) -> Option<u64> {
        let guard = self.send.lock().ok()?;
        guard.as_ref().map(CipherState::nonce)
    }

    pub fn highest_received_nonce(&self) -> Option<u64> {
        let guard = self.recv.lock().ok()?;
        guard.as_ref().and_then(|r| r.window.highest())
    }

    /// Wipe the handshake and both transport keys. Idempotent.
    pub fn destroy(&mut self) {
        if let Some(mut hs) = self.handshake.take() {
            hs.destroy();
        }
        let send = self.send.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(cipher) = send.as_mut() {
            cipher.destroy();
        }
        *send = None;
        let recv = self.recv.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(receiver) = recv.as_mut() {
            receiver.cipher.destroy();
            receiver.window.reset();
        }
        *recv = None;

        if !self.destroyed {
            debug!(role = %self.role, "noise session destroyed");
        }
        self.destroyed = true;
    }

    fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.destroyed {
            return Err(SessionError::Destroyed);
        }
        Ok(())
    }

    fn ensure_established(&self) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if self.state != SessionState::Established {
            return Err(SessionError::NotEstablished);
        }
        Ok(())
    }

    fn handshake_mut(&mut self) -> Result<&mut HandshakeState, SessionError> {
        self.handshake
            .as_mut()
            .ok_or_else(|| SessionError::InvalidState("handshake missing".into()))
    }
}

impl Drop for NoiseSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for NoiseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, SessionError> {
    mutex.lock().map_err(|_| SessionError::LockPoisoned)
}
