#![forbid(unsafe_code)]
//! Tether link layer.
//!
//! Everything between "a peer showed up on the transport" and "we hold an
//! authenticated session with a known contact":
//!
//! - [`HandshakeCoordinator`] runs the connection phases for one peer,
//!   tolerating reordered and duplicated messages.
//! - [`SessionManager`] holds one Noise session per peer.
//! - [`poll_with_backoff`] waits for collaborator state that lags behind
//!   the handshake.
//! - [`ChannelTransport`], [`MemoryIdentityStore`] and [`MemoryQueue`] are
//!   in-process collaborators for tests and simulations.

pub mod config;
pub mod contact;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod memory;
pub mod phase;
pub mod retry;
pub mod traits;

pub use config::{CoordinatorConfig, LocalIdentity, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_BUFFERED_MESSAGES};
pub use contact::ContactCard;
pub use coordinator::HandshakeCoordinator;
pub use error::{CoordinatorError, FailureKind, ManagerError, TransportError};
pub use manager::{SessionManager, SharedSession};
pub use memory::{ChannelTransport, MemoryIdentityStore, MemoryQueue, StoredIdentity};
pub use phase::{accepting_phase, Phase};
pub use retry::{poll_with_backoff, PollError, RetryPolicy};
pub use traits::{
    Collaborators, CompletionCallback, IdentityStore, MessageQueue, PeerContact, PeerKeyStore,
    Transport,
};
