//! ChaCha20-Poly1305 cipher state.
//!
//! A `CipherState` holds one 32-byte key and a 64-bit nonce counter. The
//! 96-bit AEAD nonce is four zero bytes followed by the counter in
//! little-endian order. Counter value `u64::MAX` is reserved and never used
//! for encryption.
//!
//! Two ways to pick the nonce:
//! - `encrypt_with_ad` / `decrypt_with_ad` use the internal counter and
//!   advance it on success.
//! - `encrypt_with_nonce` / `decrypt_with_nonce` take the nonce from the
//!   caller and leave the counter alone. Callers using these are
//!   responsible for never repeating a nonce under the same key.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Cipher key length.
pub const KEY_LEN: usize = 32;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Reserved nonce value; reaching it means the key must be retired.
pub const MAX_NONCE: u64 = u64::MAX;

#[derive(Clone, Default)]
pub struct CipherState {
    key: Option<Zeroizing<[u8; KEY_LEN]>>,
    nonce: u64,
    destroyed: bool,
}

impl CipherState {
    /// Create an empty cipher state (no key yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cipher state with the given key and nonce 0.
    pub fn with_key(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Some(Zeroizing::new(key)),
            nonce: 0,
            destroyed: false,
        }
    }

    /// Bind a key and reset the nonce counter.
    pub fn initialize_key(&mut self, key: [u8; KEY_LEN]) -> Result<(), CryptoError> {
        if self.destroyed {
            return Err(CryptoError::Destroyed);
        }
        self.key = Some(Zeroizing::new(key));
        self.nonce = 0;
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        !self.destroyed && self.key.is_some()
    }

    /// Next nonce the internal counter will use.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Pin the internal counter.
    ///
    /// Re-encrypting different plaintext under a pinned nonce reuses the
    /// keystream. Only for deterministic tests and explicit resynchronisation.
    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    /// Encrypt with the internal counter, then advance it.
    ///
    /// Output is `ciphertext || tag`, `plaintext.len() + 16` bytes.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce;
        let ciphertext = self.encrypt_with_nonce(nonce, ad, plaintext)?;
        self.nonce = nonce + 1;
        Ok(ciphertext)
    }

    /// Decrypt with the internal counter. The counter advances only if the
    /// tag verifies.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.nonce;
        let plaintext = self.decrypt_with_nonce(nonce, ad, ciphertext)?;
        self.nonce = nonce + 1;
        Ok(plaintext)
    }

    pub fn encrypt_with_nonce(
        &self,
        nonce: u64,
        ad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let aead = self.aead(nonce)?;
        aead.encrypt(
            &nonce_bytes(nonce),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::state("plaintext exceeds AEAD limit"))
    }

    /// Decrypt with an explicit nonce. Fails closed on any tag mismatch.
    pub fn decrypt_with_nonce(
        &self,
        nonce: u64,
        ad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let aead = self.aead(nonce)?;
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::MessageTooShort {
                minimum: TAG_LEN,
                actual: ciphertext.len(),
            });
        }
        aead.decrypt(
            &nonce_bytes(nonce),
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Wipe the key. Idempotent; every later operation fails.
    pub fn destroy(&mut self) {
        self.key = None;
        self.nonce = 0;
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn aead(&self, nonce: u64) -> Result<ChaCha20Poly1305, CryptoError> {
        if self.destroyed {
            return Err(CryptoError::Destroyed);
        }
        let key = self.key.as_ref().ok_or(CryptoError::MissingKey)?;
        if nonce == MAX_NONCE {
            return Err(CryptoError::NonceExhausted);
        }
        Ok(ChaCha20Poly1305::new((&**key).into()))
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .field("has_key", &self.has_key())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Noise nonce encoding: 32 zero bits then the counter, little-endian.
fn nonce_bytes(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}
