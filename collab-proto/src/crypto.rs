//! Shared-key authenticated encryption for relay traffic.
//!
//! A [`CryptoContext`] wraps one 32-byte ChaCha20-Poly1305 key. The relay
//! server generates a single context per run and hands its raw key to every
//! peer that connects, so all sessions of one server share one key domain.
//!
//! Token layout: `[nonce (12 bytes)][ciphertext][tag (16 bytes)]`. Every call
//! to [`CryptoContext::encrypt`] draws a fresh random nonce, so encrypting the
//! same plaintext twice yields different tokens.

use std::fmt;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use zeroize::Zeroizing;

/// Length of the raw shared key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the nonce prepended to every token.
pub const NONCE_LEN: usize = 12;

/// Length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

/// Errors raised by [`CryptoContext`] operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Key material has the wrong length.
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// The AEAD refused to seal the plaintext.
    #[error("encryption failed")]
    EncryptionFailed,

    /// The token was produced under a different key, was truncated, or was
    /// altered in transit.
    #[error("token failed authentication")]
    Authentication,
}

/// One symmetric key plus the cipher instance built from it.
///
/// The key is immutable after construction; clones share nothing mutable and
/// can be used from any number of tasks without synchronization.
#[derive(Clone)]
pub struct CryptoContext {
    key: Zeroizing<[u8; KEY_LEN]>,
    cipher: ChaCha20Poly1305,
}

impl CryptoContext {
    /// Generate a fresh key from the operating system's CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let generated = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&generated);
        let cipher = ChaCha20Poly1305::new(&generated);
        Self { key, cipher }
    }

    /// Build a context from raw key bytes received during the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless `bytes` is exactly
    /// [`KEY_LEN`] bytes long.
    pub fn from_key(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        let cipher = ChaCha20Poly1305::new_from_slice(bytes)
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self { key, cipher })
    }

    /// Raw key bytes, as transmitted to peers during the handshake.
    #[must_use]
    pub fn key_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Encrypt `plaintext` into a self-contained token.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the AEAD rejects the
    /// input (only possible for absurdly large plaintexts).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(token)
    }

    /// Verify and decrypt a token produced by [`CryptoContext::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Authentication`] if the token is shorter than a
    /// nonce plus tag, was sealed under another key, or has been modified.
    pub fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if token.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Authentication);
        }
        let (nonce, ciphertext) = token.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("key", &"<redacted>")
            .finish_non_exhaustive()
    }
}
