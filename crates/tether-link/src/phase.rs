//! Coordinator phases.
//!
//! Phases are totally ordered. Every non-terminal phase has exactly one
//! predecessor, so the coordinator can only ever advance one step at a
//! time. Both roles walk the same sequence: a Noise phase is entered when
//! the corresponding message has been exchanged, whichever side sent it.

use std::fmt;

use tether_core::MessageKind;
use tether_crypto::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Idle,
    ReadySent,
    ReadyExchanged,
    NoiseHandshake1Sent,
    NoiseHandshake2Sent,
    NoiseHandshakeComplete,
    PeerKeyConfirmed,
    ContactSent,
    Complete,
    Failed,
    Cancelled,
}

impl Phase {
    /// The only phase this one may be entered from. Terminal failure phases
    /// may be entered from anywhere and return `None`.
    pub fn predecessor(self) -> Option<Phase> {
        match self {
            Phase::Idle | Phase::Failed | Phase::Cancelled => None,
            Phase::ReadySent => Some(Phase::Idle),
            Phase::ReadyExchanged => Some(Phase::ReadySent),
            Phase::NoiseHandshake1Sent => Some(Phase::ReadyExchanged),
            Phase::NoiseHandshake2Sent => Some(Phase::NoiseHandshake1Sent),
            Phase::NoiseHandshakeComplete => Some(Phase::NoiseHandshake2Sent),
            Phase::PeerKeyConfirmed => Some(Phase::NoiseHandshakeComplete),
            Phase::ContactSent => Some(Phase::PeerKeyConfirmed),
            Phase::Complete => Some(Phase::ContactSent),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed | Phase::Cancelled)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::ReadySent => "ready_sent",
            Phase::ReadyExchanged => "ready_exchanged",
            Phase::NoiseHandshake1Sent => "noise_handshake_1_sent",
            Phase::NoiseHandshake2Sent => "noise_handshake_2_sent",
            Phase::NoiseHandshakeComplete => "noise_handshake_complete",
            Phase::PeerKeyConfirmed => "peer_key_confirmed",
            Phase::ContactSent => "contact_sent",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Phase in which `role` handles an inbound message of `kind`, or `None`
/// if `role` never accepts it during the handshake.
///
/// `Data` belongs to `Complete`: the peer may finish first and start sending
/// before its contact card reaches us, so it is held until the handshake is
/// done and then handed to the caller.
pub fn accepting_phase(kind: MessageKind, role: Role) -> Option<Phase> {
    match (kind, role) {
        (MessageKind::ConnectionReady, _) => Some(Phase::ReadySent),
        (MessageKind::Data, _) => Some(Phase::Complete),
        (MessageKind::NoiseHandshake1, Role::Responder) => Some(Phase::ReadyExchanged),
        (MessageKind::NoiseHandshake2, Role::Initiator) => Some(Phase::NoiseHandshake1Sent),
        (MessageKind::NoiseHandshake3, Role::Responder) => Some(Phase::NoiseHandshake2Sent),
        (MessageKind::Contact, _) => Some(Phase::ContactSent),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEQUENCE: [Phase; 9] = [
        Phase::Idle,
        Phase::ReadySent,
        Phase::ReadyExchanged,
        Phase::NoiseHandshake1Sent,
        Phase::NoiseHandshake2Sent,
        Phase::NoiseHandshakeComplete,
        Phase::PeerKeyConfirmed,
        Phase::ContactSent,
        Phase::Complete,
    ];

    #[test]
    fn test_single_predecessor_chain() {
        for pair in SEQUENCE.windows(2) {
            assert_eq!(pair[1].predecessor(), Some(pair[0]));
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(Phase::Idle.predecessor(), None);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Complete.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(Phase::Cancelled.is_terminal());
        assert!(!Phase::ContactSent.is_terminal());
    }

    #[test]
    fn test_accepting_phase_by_role() {
        assert_eq!(
            accepting_phase(MessageKind::NoiseHandshake1, Role::Responder),
            Some(Phase::ReadyExchanged)
        );
        assert_eq!(accepting_phase(MessageKind::NoiseHandshake1, Role::Initiator), None);
        assert_eq!(accepting_phase(MessageKind::NoiseHandshake2, Role::Responder), None);
        assert_eq!(accepting_phase(MessageKind::NoiseHandshake3, Role::Initiator), None);
        assert_eq!(
            accepting_phase(MessageKind::Data, Role::Initiator),
            Some(Phase::Complete)
        );
        assert_eq!(
            accepting_phase(MessageKind::Contact, Role::Initiator),
            Some(Phase::ContactSent)
        );
    }
}
