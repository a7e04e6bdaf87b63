//! Noise XX handshake state machine.
//!
//! ```text
//!   -> e                  message A, 32 bytes
//!   <- e, ee, s, es       message B, 80 bytes
//!   -> s, se              message C, 48 bytes
//! ```
//!
//! Messages carry no payload; the static keys are the only encrypted
//! content. Each step checks role, position and exact length before touching
//! any state. A DH or authentication failure after that point moves the
//! handshake to [`HandshakeStep::Failed`] and wipes its key material.

use std::fmt;

use crate::cipher::{CipherState, TAG_LEN};
use crate::dh::{KeyPair, DH_LEN};
use crate::error::CryptoError;
use crate::symmetric::SymmetricState;

pub const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_SHA256";

pub const MESSAGE_A_LEN: usize = DH_LEN;
pub const MESSAGE_B_LEN: usize = DH_LEN + DH_LEN + TAG_LEN;
pub const MESSAGE_C_LEN: usize = DH_LEN + TAG_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// The next operation a handshake expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    WriteMessageA,
    ReadMessageA,
    WriteMessageB,
    ReadMessageB,
    WriteMessageC,
    ReadMessageC,
    Complete,
    Failed,
}

pub struct HandshakeState {
    role: Role,
    step: HandshakeStep,
    symmetric: SymmetricState,
    s: KeyPair,
    e: Option<KeyPair>,
    re: Option<[u8; DH_LEN]>,
    rs: Option<[u8; DH_LEN]>,
}

impl HandshakeState {
    /// Start a handshake with our static key pair and a prologue both sides
    /// must agree on.
    pub fn new(role: Role, local_static: KeyPair, prologue: &[u8]) -> Result<Self, CryptoError> {
        if local_static.is_destroyed() {
            return Err(CryptoError::Destroyed);
        }
        let mut symmetric = SymmetricState::new(PROTOCOL_NAME);
        symmetric.mix_hash(prologue);

        let step = match role {
            Role::Initiator => HandshakeStep::WriteMessageA,
            Role::Responder => HandshakeStep::ReadMessageA,
        };

        Ok(Self {
            role,
            step,
            symmetric,
            s: local_static,
            e: None,
            re: None,
            rs: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    pub fn is_complete(&self) -> bool {
        self.step == HandshakeStep::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.step == HandshakeStep::Failed
    }

    /// Exact length of the message the next read step expects, if the next
    /// step is a read.
    pub fn expected_message_len(&self) -> Option<usize> {
        match self.step {
            HandshakeStep::ReadMessageA => Some(MESSAGE_A_LEN),
            HandshakeStep::ReadMessageB => Some(MESSAGE_B_LEN),
            HandshakeStep::ReadMessageC => Some(MESSAGE_C_LEN),
            _ => None,
        }
    }

    /// Peer static key. Available to the initiator after message B and to
    /// the responder after message C.
    pub fn remote_static_public_key(&self) -> Option<&[u8; DH_LEN]> {
        self.rs.as_ref()
    }

    pub fn local_static_public_key(&self) -> &[u8; DH_LEN] {
        self.s.public_key()
    }

    /// Current transcript hash. Equal on both sides once complete.
    pub fn handshake_hash(&self) -> [u8; 32] {
        self.symmetric.handshake_hash()
    }

    /// -> e
    pub fn write_message_a(&mut self) -> Result<Vec<u8>, CryptoError> {
        self.expect_step(HandshakeStep::WriteMessageA)?;

        let e = KeyPair::generate();
        let msg = e.public_key().to_vec();
        self.symmetric.mix_hash(&msg);
        self.e = Some(e);

        self.step = HandshakeStep::ReadMessageB;
        Ok(msg)
    }

    pub fn read_message_a(&mut self, message: &[u8]) -> Result<(), CryptoError> {
        self.expect_step(HandshakeStep::ReadMessageA)?;
        let re = exact::<MESSAGE_A_LEN>(message)?;

        self.symmetric.mix_hash(&re);
        self.re = Some(re);

        self.step = HandshakeStep::WriteMessageB;
        Ok(())
    }

    /// <- e, ee, s, es
    pub fn write_message_b(&mut self) -> Result<Vec<u8>, CryptoError> {
        self.expect_step(HandshakeStep::WriteMessageB)?;

        let msg = self.guarded(|hs| {
            let re = hs.re.ok_or_else(|| CryptoError::state("missing remote ephemeral"))?;
            let e = KeyPair::generate();
            let mut msg = Vec::with_capacity(MESSAGE_B_LEN);
            msg.extend_from_slice(e.public_key());
            hs.symmetric.mix_hash(e.public_key());

            // ee
            hs.symmetric.mix_key(&*e.dh(&re)?)?;
            hs.e = Some(e);
            // s
            let enc_s = hs.symmetric.encrypt_and_hash(hs.s.public_key())?;
            msg.extend_from_slice(&enc_s);
            // es
            hs.symmetric.mix_key(&*hs.s.dh(&re)?)?;
            Ok(msg)
        })?;

        self.step = HandshakeStep::ReadMessageC;
        Ok(msg)
    }

    pub fn read_message_b(&mut self, message: &[u8]) -> Result<(), CryptoError> {
        self.expect_step(HandshakeStep::ReadMessageB)?;
        let message = exact::<MESSAGE_B_LEN>(message)?;

        self.guarded(|hs| {
            let mut re = [0u8; DH_LEN];
            re.copy_from_slice(&message[..DH_LEN]);
            hs.symmetric.mix_hash(&re);
            hs.re = Some(re);

            let e = hs.ephemeral()?;
            // ee
            let ee = e.dh(&re)?;
            hs.symmetric.mix_key(&*ee)?;
            // s
            let rs = hs.symmetric.decrypt_and_hash(&message[DH_LEN..])?;
            let rs = exact::<DH_LEN>(&rs)?;
            // es
            let es = hs.ephemeral()?.dh(&rs)?;
            hs.symmetric.mix_key(&*es)?;
            hs.rs = Some(rs);
            Ok(())
        })?;

        self.step = HandshakeStep::WriteMessageC;
        Ok(())
    }

    /// -> s, se
    pub fn write_message_c(&mut self) -> Result<Vec<u8>, CryptoError> {
        self.expect_step(HandshakeStep::WriteMessageC)?;

        let msg = self.guarded(|hs| {
            let re = hs.re.ok_or_else(|| CryptoError::state("missing remote ephemeral"))?;
            // s
            let msg = hs.symmetric.encrypt_and_hash(hs.s.public_key())?;
            // se
            hs.symmetric.mix_key(&*hs.s.dh(&re)?)?;
            Ok(msg)
        })?;

        self.step = HandshakeStep::Complete;
        Ok(msg)
    }

    pub fn read_message_c(&mut self, message: &[u8]) -> Result<(), CryptoError> {
        self.expect_step(HandshakeStep::ReadMessageC)?;
        let message = exact::<MESSAGE_C_LEN>(message)?;

        self.guarded(|hs| {
            // s
            let rs = hs.symmetric.decrypt_and_hash(&message)?;
            let rs = exact::<DH_LEN>(&rs)?;
            // se
            let se = hs.ephemeral()?.dh(&rs)?;
            hs.symmetric.mix_key(&*se)?;
            hs.rs = Some(rs);
            Ok(())
        })?;

        self.step = HandshakeStep::Complete;
        Ok(())
    }

    /// Transport cipher states oriented for this side: `(send, receive)`.
    pub fn split(&self) -> Result<(CipherState, CipherState), CryptoError> {
        if self.step != HandshakeStep::Complete {
            return Err(CryptoError::state(format!(
                "split requires a complete handshake, currently at {:?}",
                self.step
            )));
        }
        let (i_to_r, r_to_i) = self.symmetric.split()?;
        Ok(match self.role {
            Role::Initiator => (i_to_r, r_to_i),
            Role::Responder => (r_to_i, i_to_r),
        })
    }

    /// Wipe ephemeral, static and chaining key material. Idempotent.
    ///
    /// The remote static key is kept; it is public and callers may still
    /// need it to identify the peer.
    pub fn destroy(&mut self) {
        if let Some(e) = self.e.as_mut() {
            e.destroy();
        }
        self.e = None;
        self.re = None;
        self.s.destroy();
        self.symmetric.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.symmetric.is_destroyed()
    }

    fn expect_step(&self, expected: HandshakeStep) -> Result<(), CryptoError> {
        if self.symmetric.is_destroyed() && self.step != HandshakeStep::Failed {
            return Err(CryptoError::Destroyed);
        }
        if self.step != expected {
            return Err(CryptoError::state(format!(
                "{} expected {:?}, handshake is at {:?}",
                self.role, expected, self.step
            )));
        }
        Ok(())
    }

    fn ephemeral(&self) -> Result<&KeyPair, CryptoError> {
        self.e
            .as_ref()
            .ok_or_else(|| CryptoError::state("missing local ephemeral"))
    }

    /// Run a step body; on error the handshake fails terminally.
    fn guarded<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        match body(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.destroy();
                self.rs = None;
                self.step = HandshakeStep::Failed;
                Err(err)
            }
        }
    }
}

impl Drop for HandshakeState {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeState")
            .field("role", &self.role)
            .field("step", &self.step)
            .field("has_remote_static", &self.rs.is_some())
            .finish()
    }
}

fn exact<const N: usize>(message: &[u8]) -> Result<[u8; N], CryptoError> {
    message
        .try_into()
        .map_err(|_| CryptoError::InvalidMessageLength {
            expected: N,
            actual: message.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROLOGUE: &[u8] = b"test-prologue";

    fn pair() -> (HandshakeState, HandshakeState, KeyPair, KeyPair) {
        let is = KeyPair::generate();
        let rs = KeyPair::generate();
        let i = HandshakeState::new(Role::Initiator, is.clone(), PROLOGUE).unwrap();
        let r = HandshakeState::new(Role::Responder, rs.clone(), PROLOGUE).unwrap();
        (i, r, is, rs)
    }

    fn run(i: &mut HandshakeState, r: &mut HandshakeState) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let a = i.write_message_a().unwrap();
        r.read_message_a(&a).unwrap();
        let b = r.write_message_b().unwrap();
        i.read_message_b(&b).unwrap();
        let c = i.write_message_c().unwrap();
        r.read_message_c(&c).unwrap();
        (a, b, c)
    }

    #[test]
    fn test_protocol_name_fits_hash() {
        assert_eq!(PROTOCOL_NAME.len(), 32);
    }

    #[test]
    fn test_message_sizes() {
        let (mut i, mut r, _, _) = pair();
        let (a, b, c) = run(&mut i, &mut r);
        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 80);
        assert_eq!(c.len(), 48);
        assert_eq!((MESSAGE_A_LEN, MESSAGE_B_LEN, MESSAGE_C_LEN), (32, 80, 48));
    }

    #[test]
    fn test_full_handshake() {
        let (mut i, mut r, is, rs) = pair();
        run(&mut i, &mut r);

        assert!(i.is_complete());
        assert!(r.is_complete());
        assert_eq!(i.handshake_hash(), r.handshake_hash());
        assert_eq!(i.remote_static_public_key(), Some(rs.public_key()));
        assert_eq!(r.remote_static_public_key(), Some(is.public_key()));
    }

    #[test]
    fn test_remote_static_availability() {
        let (mut i, mut r, _, _) = pair();
        let a = i.write_message_a().unwrap();
        r.read_message_a(&a).unwrap();
        let b = r.write_message_b().unwrap();
        assert!(r.remote_static_public_key().is_none());
        i.read_message_b(&b).unwrap();
        assert!(i.remote_static_public_key().is_some());
        let c = i.write_message_c().unwrap();
        assert!(r.remote_static_public_key().is_none());
        r.read_message_c(&c).unwrap();
        assert!(r.remote_static_public_key().is_some());
    }

    #[test]
    fn test_split_cross_decryption() {
        let (mut i, mut r, _, _) = pair();
        run(&mut i, &mut r);

        let (mut i_send, mut i_recv) = i.split().unwrap();
        let (mut r_send, mut r_recv) = r.split().unwrap();

        let ct = i_send.encrypt_with_ad(&[], b"to responder").unwrap();
        assert_eq!(r_recv.decrypt_with_ad(&[], &ct).unwrap(), b"to responder");
        let ct = r_send.encrypt_with_ad(&[], b"to initiator").unwrap();
        assert_eq!(i_recv.decrypt_with_ad(&[], &ct).unwrap(), b"to initiator");
    }

    #[test]
    fn test_split_before_complete_fails() {
        let (mut i, mut r, _, _) = pair();
        assert!(matches!(i.split(), Err(CryptoError::InvalidState(_))));
        let a = i.write_message_a().unwrap();
        r.read_message_a(&a).unwrap();
        let b = r.write_message_b().unwrap();
        assert!(matches!(r.split(), Err(CryptoError::InvalidState(_))));
        i.read_message_b(&b).unwrap();
        assert!(matches!(i.split(), Err(CryptoError::InvalidState(_))));
    }

    #[test]
    fn test_wrong_length_does_not_mutate() {
        let (mut i, mut r, _, _) = pair();
        let a = i.write_message_a().unwrap();
        let before = r.handshake_hash();

        assert_eq!(
            r.read_message_a(&a[..31]).unwrap_err(),
            CryptoError::InvalidMessageLength { expected: 32, actual: 31 }
        );
        assert_eq!(r.step(), HandshakeStep::ReadMessageA);
        assert_eq!(r.handshake_hash(), before);

        r.read_message_a(&a).unwrap();
        let b = r.write_message_b().unwrap();
        let mut long = b.clone();
        long.push(0);
        assert!(i.read_message_b(&long).is_err());
        assert_eq!(i.step(), HandshakeStep::ReadMessageB);
        i.read_message_b(&b).unwrap();
    }

    #[test]
    fn test_out_of_order_steps_rejected() {
        let (mut i, mut r, _, _) = pair();
        assert!(matches!(r.write_message_a(), Err(CryptoError::InvalidState(_))));
        assert!(matches!(i.read_message_a(&[0u8; 32]), Err(CryptoError::InvalidState(_))));
        assert!(matches!(i.write_message_c(), Err(CryptoError::InvalidState(_))));
        assert_eq!(i.step(), HandshakeStep::WriteMessageA);
    }

    #[test]
    fn test_tampered_message_b_fails_terminally() {
        let (mut i, mut r, _, _) = pair();
        let a = i.write_message_a().unwrap();
        r.read_message_a(&a).unwrap();
        let mut b = r.write_message_b().unwrap();
        b[50] ^= 0x01;

        assert_eq!(i.read_message_b(&b).unwrap_err(), CryptoError::AuthenticationFailed);
        assert!(i.is_failed());
        assert!(i.is_destroyed());
        assert!(i.write_message_c().is_err());
        assert!(i.split().is_err());
    }

    #[test]
    fn test_tampered_message_c_fails() {
        let (mut i, mut r, _, _) = pair();
        let a = i.write_message_a().unwrap();
        r.read_message_a(&a).unwrap();
        let b = r.write_message_b().unwrap();
        i.read_message_b(&b).unwrap();
        let mut c = i.write_message_c().unwrap();
        c[0] ^= 0x80;
        assert_eq!(r.read_message_c(&c).unwrap_err(), CryptoError::AuthenticationFailed);
        assert!(r.is_failed());
        assert!(r.remote_static_public_key().is_none());
    }

    #[test]
    fn test_prologue_mismatch_fails() {
        let mut i = HandshakeState::new(Role::Initiator, KeyPair::generate(), b"one").unwrap();
        let mut r = HandshakeState::new(Role::Responder, KeyPair::generate(), b"two").unwrap();
        let a = i.write_message_a().unwrap();
        r.read_message_a(&a).unwrap();
        let b = r.write_message_b().unwrap();
        assert_eq!(i.read_message_b(&b).unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_low_order_ephemeral_rejected() {
        let mut r = HandshakeState::new(Role::Responder, KeyPair::generate(), PROLOGUE).unwrap();
        r.read_message_a(&[0u8; 32]).unwrap();
        assert_eq!(r.write_message_b().unwrap_err(), CryptoError::LowOrderPoint);
        assert!(r.is_failed());
    }

    #[test]
    fn test_destroyed_static_rejected() {
        let mut kp = KeyPair::generate();
        kp.destroy();
        assert_eq!(
            HandshakeState::new(Role::Initiator, kp, PROLOGUE).unwrap_err(),
            CryptoError::Destroyed
        );
    }

    #[test]
    fn test_destroy_mid_handshake() {
        let (mut i, mut r, _, _) = pair();
        let a = i.write_message_a().unwrap();
        r.read_message_a(&a).unwrap();
        i.destroy();
        i.destroy();
        assert!(i.is_destroyed());
        assert_eq!(i.handshake_hash(), [0u8; 32]);
        let b = r.write_message_b().unwrap();
        assert_eq!(i.read_message_b(&b).unwrap_err(), CryptoError::Destroyed);
    }

    #[test]
    fn test_handshakes_are_unique() {
        let (mut i1, mut r1, _, _) = pair();
        let (mut i2, mut r2, _, _) = pair();
        run(&mut i1, &mut r1);
        run(&mut i2, &mut r2);
        assert_ne!(i1.handshake_hash(), i2.handshake_hash());
    }
}
