//! Error types for handshake coordination.

use thiserror::Error;

use tether_core::MessageKind;
use tether_crypto::{ErrorKind, SessionError};

use crate::phase::Phase;

/// Coarse class of a coordinator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed or out-of-protocol input.
    Structural,
    /// AEAD or key verification failed.
    Authentication,
    /// A deadline or the peer-key retry budget ran out.
    Timing,
    Transport,
    /// Identity store or message queue failed.
    Collaborator,
    /// An operation called outside its lifecycle.
    Misuse,
    Cancelled,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("no session for peer {0}")]
    UnknownPeer(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Terminal coordinator failure.
///
/// Cloneable because it is both returned to the caller and handed to the
/// completion callback.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unexpected {kind} message in phase {phase}")]
    UnexpectedMessage { kind: MessageKind, phase: Phase },

    #[error("message from unexpected peer {actual} (expected {expected})")]
    UnexpectedPeer { expected: String, actual: String },

    #[error("too many early messages buffered (limit {0})")]
    BufferOverflow(usize),

    #[error("noise handshake failed: {0}")]
    Handshake(#[from] SessionError),

    #[error("peer static key does not match the authenticated handshake key")]
    KeyMismatch,

    #[error("timed out waiting for peer key after {attempts} attempts ({elapsed_ms} ms)")]
    KeyUnavailable { attempts: u32, elapsed_ms: u64 },

    #[error("handshake timed out in phase {0}")]
    Timeout(Phase),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("inbound message stream closed")]
    TransportClosed,

    #[error("collaborator failed: {0}")]
    Collaborator(String),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("coordinator cancelled")]
    Cancelled,

    #[error("coordinator already finished in phase {0}")]
    Closed(Phase),

    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },
}

impl CoordinatorError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CoordinatorError::Malformed(_)
            | CoordinatorError::UnexpectedMessage { .. }
            | CoordinatorError::UnexpectedPeer { .. }
            | CoordinatorError::BufferOverflow(_) => FailureKind::Structural,
            CoordinatorError::Handshake(err) => session_kind(err),
            CoordinatorError::KeyMismatch => FailureKind::Authentication,
            CoordinatorError::KeyUnavailable { .. } | CoordinatorError::Timeout(_) => {
                FailureKind::Timing
            }
            CoordinatorError::Transport(_) | CoordinatorError::TransportClosed => {
                FailureKind::Transport
            }
            CoordinatorError::Collaborator(_) => FailureKind::Collaborator,
            CoordinatorError::Manager(ManagerError::Session(err)) => session_kind(err),
            CoordinatorError::Manager(ManagerError::UnknownPeer(_))
            | CoordinatorError::Closed(_)
            | CoordinatorError::InvalidTransition { .. } => FailureKind::Misuse,
            CoordinatorError::Cancelled => FailureKind::Cancelled,
        }
    }

    pub(crate) fn collaborator(err: anyhow::Error) -> Self {
        CoordinatorError::Collaborator(format!("{:#}", err))
    }
}

fn session_kind(err: &SessionError) -> FailureKind {
    match err.kind() {
        ErrorKind::Structural => FailureKind::Structural,
        // Bad key material here always came from the peer.
        ErrorKind::Authentication | ErrorKind::InvalidInput => FailureKind::Authentication,
        ErrorKind::Misuse => FailureKind::Misuse,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_crypto::CryptoError;

    #[test]
    fn test_failure_kinds() {
        assert_eq!(
            CoordinatorError::Handshake(SessionError::Crypto(CryptoError::AuthenticationFailed))
                .kind(),
            FailureKind::Authentication
        );
        assert_eq!(
            CoordinatorError::Handshake(SessionError::Crypto(CryptoError::InvalidMessageLength {
                expected: 80,
                actual: 12
            }))
            .kind(),
            FailureKind::Structural
        );
        assert_eq!(
            CoordinatorError::KeyUnavailable { attempts: 5, elapsed_ms: 750 }.kind(),
            FailureKind::Timing
        );
        assert_eq!(CoordinatorError::Cancelled.kind(), FailureKind::Cancelled);
        assert_eq!(
            CoordinatorError::from(TransportError::Closed).kind(),
            FailureKind::Transport
        );
    }

    #[test]
    fn test_collaborator_error_keeps_context() {
        let err = anyhow::anyhow!("disk full").context("saving identity");
        let err = CoordinatorError::collaborator(err);
        assert_eq!(
            err,
            CoordinatorError::Collaborator("saving identity: disk full".into())
        );
    }
}
