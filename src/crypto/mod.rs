//! Symmetric payload encryption for the agent wire protocol.
//!
//! The protocol engine only depends on the [`Cipher`] contract; the
//! production implementation is [`NetworkCipher`] (ChaCha20-Poly1305).

pub mod cipher;
pub mod keys;

pub use cipher::NetworkCipher;

use crate::Result;

/// Symmetric encrypt/decrypt contract consumed by the protocol engine.
///
/// Implementations must return printable ASCII from [`encrypt`](Cipher::encrypt)
/// because the token is embedded as a JSON string inside each frame.
pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext` into an ASCII token.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Crypto`] if encryption fails.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a token produced by [`encrypt`](Cipher::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Decryption`] if the token is corrupt or was
    /// produced under a different key.
    fn decrypt(&self, token: &[u8]) -> Result<Vec<u8>>;
}
