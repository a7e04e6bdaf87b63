//! Noise symmetric state: chaining key, handshake hash and the handshake
//! cipher.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::CipherState;
use crate::error::CryptoError;

/// SHA-256 output length.
pub const HASH_LEN: usize = 32;

pub struct SymmetricState {
    ck: Zeroizing<[u8; HASH_LEN]>,
    h: [u8; HASH_LEN],
    cipher: CipherState,
    destroyed: bool,
}

impl SymmetricState {
    /// Initialize from a protocol name.
    ///
    /// Names up to 32 bytes are zero-padded and used as the initial hash;
    /// longer names are hashed. The chaining key starts equal to the hash.
    pub fn new(protocol_name: &[u8]) -> Self {
        let h: [u8; HASH_LEN] = if protocol_name.len() <= HASH_LEN {
            let mut h = [0u8; HASH_LEN];
            h[..protocol_name.len()].copy_from_slice(protocol_name);
            h
        } else {
            Sha256::digest(protocol_name).into()
        };

        Self {
            ck: Zeroizing::new(h),
            h,
            cipher: CipherState::new(),
            destroyed: false,
        }
    }

    /// h = SHA256(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    /// Derive a new chaining key and handshake cipher key from `ikm`.
    pub fn mix_key(&mut self, ikm: &[u8]) -> Result<(), CryptoError> {
        if self.destroyed {
            return Err(CryptoError::Destroyed);
        }
        let (ck, k) = self.hkdf2(ikm)?;
        *self.ck = *ck;
        self.cipher.initialize_key(*k)
    }

    /// Encrypt under the handshake cipher (or pass through if no key has been
    /// mixed yet) and fold the output into the hash.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.destroyed {
            return Err(CryptoError::Destroyed);
        }
        let out = if self.cipher.has_key() {
            self.cipher.encrypt_with_ad(&self.h, plaintext)?
        } else {
            plaintext.to_vec()
        };
        self.mix_hash(&out);
        Ok(out)
    }

    /// Inverse of [`encrypt_and_hash`](Self::encrypt_and_hash). The hash is
    /// only updated if decryption succeeds.
    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.destroyed {
            return Err(CryptoError::Destroyed);
        }
        let out = if self.cipher.has_key() {
            self.cipher.decrypt_with_ad(&self.h, ciphertext)?
        } else {
            ciphertext.to_vec()
        };
        self.mix_hash(ciphertext);
        Ok(out)
    }

    pub fn has_key(&self) -> bool {
        self.cipher.has_key()
    }

    pub fn handshake_hash(&self) -> [u8; HASH_LEN] {
        self.h
    }

    /// Derive the two transport cipher states from the final chaining key.
    ///
    /// The first cipher is for initiator-to-responder traffic.
    pub fn split(&self) -> Result<(CipherState, CipherState), CryptoError> {
        if self.destroyed {
            return Err(CryptoError::Destroyed);
        }
        if !self.cipher.has_key() {
            return Err(CryptoError::state("split before any key material was mixed"));
        }
        let (k1, k2) = self.hkdf2(&[])?;
        Ok((CipherState::with_key(*k1), CipherState::with_key(*k2)))
    }

    /// Wipe the chaining key, hash and handshake cipher. Idempotent.
    pub fn destroy(&mut self) {
        self.ck.zeroize();
        self.h.zeroize();
        self.cipher.destroy();
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn hkdf2(
        &self,
        ikm: &[u8],
    ) -> Result<(Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>), CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck[..]), ikm);
        let mut okm = Zeroizing::new([0u8; 64]);
        hk.expand(&[], &mut okm[..])
            .map_err(|_| CryptoError::KeyDerivation)?;

        let mut first = Zeroizing::new([0u8; 32]);
        let mut second = Zeroizing::new([0u8; 32]);
        first.copy_from_slice(&okm[..32]);
        second.copy_from_slice(&okm[32..]);
        Ok((first, second))
    }
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        self.destroy();
    }
}
