//! Noise engine for Tether secure channels.
//!
//! This crate provides:
//! - X25519 key generation and Diffie-Hellman ([`dh`])
//! - ChaCha20-Poly1305 cipher state with explicit nonce control ([`cipher`])
//! - The Noise symmetric state: running hash and chaining key ([`symmetric`])
//! - The three-message XX handshake state machine ([`handshake`])
//! - Replay protection for received transport messages ([`replay`])
//! - Per-peer sessions with nonce framing ([`session`])
//!
//! # Design
//!
//! Implements `Noise_XX_25519_ChaChaPoly_SHA256` directly on top of the
//! primitive crates rather than through a Noise library, so that every step
//! of the key schedule is visible and testable:
//! - Mutual authentication (both peers prove possession of a static key)
//! - Identity hiding (static keys travel encrypted)
//! - Forward secrecy (fresh ephemeral keys per handshake)
//!
//! The link underneath is a radio characteristic with no delivery
//! guarantees, so transport messages carry their nonce explicitly and the
//! receiver checks it against a replay window before accepting.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod dh;
pub mod error;
pub mod handshake;
pub mod replay;
pub mod session;
pub mod symmetric;

pub use cipher::{CipherState, TAG_LEN};
pub use dh::{calculate, generate_keypair, KeyPair, DH_LEN};
pub use error::{CryptoError, ErrorKind};
pub use handshake::{
    HandshakeState, HandshakeStep, Role, MESSAGE_A_LEN, MESSAGE_B_LEN, MESSAGE_C_LEN,
    PROTOCOL_NAME,
};
pub use replay::ReplayWindow;
pub use session::{
    NoiseSession, SessionConfig, SessionError, SessionState, DEFAULT_PROLOGUE, FRAME_OVERHEAD,
    MAX_MESSAGE_LEN, MAX_PLAINTEXT_LEN,
};
pub use symmetric::SymmetricState;
