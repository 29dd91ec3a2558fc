//! Message encryption.
//!
//! [`Cipher`] is the only boundary where message plaintext is turned into
//! sealed bytes and back. [`envelope::MessageEnvelope`] decides per
//! conversation whether to use it and converts failures into displayable
//! placeholders.

pub mod chacha;
pub mod envelope;

pub use chacha::ChaChaCipher;
pub use envelope::{MessageEnvelope, OpenedBody};

use convosync_proto::message::SealedEnvelope;

use crate::error::ErrorKind;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The key material is malformed.
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// Encryption is enabled but no key is configured.
    #[error("encryption is enabled but no key is configured")]
    MissingKey,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (corrupted ciphertext, wrong key, or tampered data).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

impl CryptoError {
    /// Maps this error onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidKey(_) | Self::MissingKey => ErrorKind::ConfigurationAbsent,
            Self::EncryptionFailed(_) | Self::DecryptionFailed(_) => ErrorKind::DecryptionFailure,
        }
    }
}

/// Symmetric authenticated encryption of message bodies.
///
/// Implementations choose a fresh nonce for every call to
/// [`Cipher::encrypt`]; reusing a nonce under the same key is never
/// acceptable.
pub trait Cipher: Send + Sync {
    /// Encrypts `plaintext` into a sealed envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the AEAD refuses the input.
    fn encrypt(&self, plaintext: &[u8]) -> Result<SealedEnvelope, CryptoError>;

    /// Decrypts and authenticates a sealed envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] for a wrong key, a
    /// malformed nonce, or tampered ciphertext.
    fn decrypt(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>, CryptoError>;
}
