//! X25519 key pairs and Diffie-Hellman.
//!
//! Private scalars live in [`Zeroizing`] buffers and are wiped on
//! [`KeyPair::destroy`] or drop. After destruction the private half reads as
//! `None` and any DH attempt fails with [`CryptoError::Destroyed`].

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Length of X25519 private keys, public keys and shared secrets.
pub const DH_LEN: usize = 32;

/// X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    private: Option<Zeroizing<[u8; DH_LEN]>>,
    public: [u8; DH_LEN],
}

impl KeyPair {
    /// Generate a new key pair from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut private = Zeroizing::new([0u8; DH_LEN]);
        OsRng.fill_bytes(&mut private[..]);
        Self::from_zeroizing(private)
    }

    /// Build a key pair from an existing private scalar.
    pub fn from_private(private: [u8; DH_LEN]) -> Self {
        Self::from_zeroizing(Zeroizing::new(private))
    }

    fn from_zeroizing(private: Zeroizing<[u8; DH_LEN]>) -> Self {
        let public = x25519(*private, X25519_BASEPOINT_BYTES);
        Self {
            private: Some(private),
            public,
        }
    }

    pub fn public_key(&self) -> &[u8; DH_LEN] {
        &self.public
    }

    /// The private scalar, or `None` once destroyed.
    pub fn private_key(&self) -> Option<&[u8; DH_LEN]> {
        self.private.as_deref()
    }

    /// Diffie-Hellman between our private key and `peer_public`.
    pub fn dh(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; DH_LEN]>, CryptoError> {
        let private = self.private.as_ref().ok_or(CryptoError::Destroyed)?;
        calculate(private.as_slice(), peer_public)
    }

    /// Wipe the private scalar. Idempotent.
    pub fn destroy(&mut self) {
        // Zeroizing wipes the buffer when the Option drops it.
        self.private = None;
    }

    pub fn is_destroyed(&self) -> bool {
        self.private.is_none()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("private", &if self.private.is_some() { "[redacted]" } else { "[destroyed]" })
            .finish()
    }
}

/// Generate a fresh X25519 key pair.
pub fn generate_keypair() -> KeyPair {
    KeyPair::generate()
}

/// X25519 between a raw private scalar and a raw peer public key.
///
/// Both inputs must be exactly 32 bytes. An all-zero result means the peer
/// sent a low-order point and is rejected.
pub fn calculate(
    private_key: &[u8],
    peer_public_key: &[u8],
) -> Result<Zeroizing<[u8; DH_LEN]>, CryptoError> {
    let private: [u8; DH_LEN] = private_key
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: DH_LEN,
            actual: private_key.len(),
        })?;
    let private = Zeroizing::new(private);
    let public: [u8; DH_LEN] = peer_public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: DH_LEN,
            actual: peer_public_key.len(),
        })?;

    let shared = Zeroizing::new(x25519(*private, public));
    if shared.iter().fold(0u8, |acc, b| acc | b) == 0 {
        return Err(CryptoError::LowOrderPoint);
    }
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex32(s: &str) -> [u8; 32] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_rfc7748_function_vector() {
        // RFC 7748 section 5.2, first vector.
        let scalar = unhex32("a546e36bf0527c9d3b16154b82465edd62144c0ac1fc5a18506a2244ba449ac4");
        let u = unhex32("e6db6867583030db3594c1a424b15f7c726624ec26b3353b10a903a6d0ab1c4c");
        let out = calculate(&scalar, &u).unwrap();
        assert_eq!(
            hex::encode(*out),
            "c3da55379de9c6908e94ea4df28d084f32eccf03491c71f754b4075577a28552"
        );
    }

    #[test]
    fn test_rfc7748_diffie_hellman_vector() {
        // RFC 7748 section 6.1.
        let alice = KeyPair::from_private(unhex32(
            "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
        ));
        let bob = KeyPair::from_private(unhex32(
            "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb",
        ));

        assert_eq!(
            hex::encode(alice.public_key()),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
        assert_eq!(
            hex::encode(bob.public_key()),
            "de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f"
        );

        let k1 = alice.dh(bob.public_key()).unwrap();
        let k2 = bob.dh(alice.public_key()).unwrap();
        assert_eq!(*k1, *k2);
        assert_eq!(
            hex::encode(*k1),
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );
    }

    #[test]
    fn test_dh_symmetry_random_keys() {
        for _ in 0..16 {
            let a = generate_keypair();
            let b = generate_keypair();
            let ab = calculate(a.private_key().unwrap(), b.public_key()).unwrap();
            let ba = calculate(b.private_key().unwrap(), a.public_key()).unwrap();
            assert_eq!(*ab, *ba);
        }
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_ne!(a.public_key(), b.public_key());
        assert_ne!(a.private_key(), b.private_key());
    }

    #[test]
    fn test_invalid_lengths() {
        let kp = generate_keypair();
        assert_eq!(
            calculate(&[0u8; 31], kp.public_key()).unwrap_err(),
            CryptoError::InvalidKeyLength { expected: 32, actual: 31 }
        );
        assert_eq!(
            kp.dh(&[1u8; 33]).unwrap_err(),
            CryptoError::InvalidKeyLength { expected: 32, actual: 33 }
        );
        assert!(kp.dh(&[]).is_err());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let kp = generate_keypair();
        assert_eq!(kp.dh(&[0u8; 32]).unwrap_err(), CryptoError::LowOrderPoint);
    }

    #[test]
    fn test_destroy_wipes_private_key() {
        let mut kp = generate_keypair();
        let peer = generate_keypair();
        assert!(kp.private_key().is_some());

        kp.destroy();
        assert!(kp.is_destroyed());
        assert!(kp.private_key().is_none());
        assert_eq!(kp.dh(peer.public_key()).unwrap_err(), CryptoError::Destroyed);

        // Idempotent
        kp.destroy();
        assert!(kp.private_key().is_none());
    }
}
