//! Error types for the Noise primitives and handshake.

use thiserror::Error;

/// Broad classification of a failure, used by callers to decide whether
/// anything may be retried. Nothing in this crate is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad key material supplied by the caller or the peer.
    InvalidInput,
    /// A message with the wrong shape for the current step.
    Structural,
    /// AEAD tag mismatch or replayed nonce.
    Authentication,
    /// An operation called outside its lifecycle.
    Misuse,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("peer public key is a low-order point")]
    LowOrderPoint,

    #[error("invalid message length: expected {expected} bytes, got {actual}")]
    InvalidMessageLength { expected: usize, actual: usize },

    #[error("message too short: expected at least {minimum} bytes, got {actual}")]
    MessageTooShort { minimum: usize, actual: usize },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("no cipher key initialized")]
    MissingKey,

    #[error("nonce space exhausted")]
    NonceExhausted,

    #[error("key material destroyed")]
    Destroyed,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("key derivation failed")]
    KeyDerivation,
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::InvalidKeyLength { .. } | CryptoError::LowOrderPoint => {
                ErrorKind::InvalidInput
            }
            CryptoError::InvalidMessageLength { .. } | CryptoError::MessageTooShort { .. } => {
                ErrorKind::Structural
            }
            CryptoError::AuthenticationFailed => ErrorKind::Authentication,
            CryptoError::MissingKey
            | CryptoError::NonceExhausted
            | CryptoError::Destroyed
            | CryptoError::InvalidState(_)
            | CryptoError::KeyDerivation => ErrorKind::Misuse,
        }
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        CryptoError::InvalidState(msg.into())
    }
}
