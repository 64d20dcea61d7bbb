//! ChaCha20-Poly1305 implementation of [`Cipher`].
//!
//! Token layout: URL-safe base64 (no padding) of `nonce || ciphertext`, where
//! the nonce is 12 random bytes drawn per message and the ciphertext carries
//! the 16-byte Poly1305 tag.

use std::fmt::{Debug, Formatter};

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use super::Cipher;
use crate::{AppError, Result};

/// Length of a network key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the per-message nonce in bytes.
pub const NONCE_LEN: usize = 12;

/// Authenticated symmetric cipher shared by every node of a team.
pub struct NetworkCipher {
    aead: ChaCha20Poly1305,
}

impl NetworkCipher {
    /// Build a cipher from raw key bytes.
    #[must_use]
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Build a cipher from a key slice, rejecting anything but 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Crypto`] if `key` has the wrong length.
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        let key: &[u8; KEY_LEN] = key.try_into().map_err(|_| {
            AppError::Crypto(format!(
                "network key must be {KEY_LEN} bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    /// Build a cipher from a URL-safe base64 key, padded or not.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Crypto`] if the text is not base64 or does not
    /// decode to 32 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let trimmed = encoded.trim();
        let raw = URL_SAFE
            .decode(trimmed)
            .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
            .map_err(|err| AppError::Crypto(format!("network key is not base64: {err}")))?;
        Self::from_slice(&raw)
    }

    /// Generate a fresh random key.
    #[must_use]
    pub fn generate_key() -> [u8; KEY_LEN] {
        let generated = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(generated.as_slice());
        key
    }

    /// Encode a raw key the way key files and `AGENT_HUDDLE_KEY` expect it.
    #[must_use]
    pub fn encode_key(key: &[u8; KEY_LEN]) -> String {
        URL_SAFE.encode(key)
    }
}

impl Debug for NetworkCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCipher").finish_non_exhaustive()
    }
}

impl Cipher for NetworkCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|err| AppError::Crypto(format!("encryption failed: {err}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed).into_bytes())
    }

    fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>> {
        let sealed = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|err| AppError::Decryption(format!("token is not base64: {err}")))?;
        if sealed.len() < NONCE_LEN {
            return Err(AppError::Decryption("token shorter than nonce".into()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AppError::Decryption("authentication failed".into()))
    }
}
