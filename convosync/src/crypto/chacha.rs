//! ChaCha20-Poly1305 [`Cipher`].

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use convosync_proto::message::{SEALED_ENVELOPE_VERSION, SealedEnvelope};
use rand::RngCore;
use zeroize::Zeroizing;

use super::{Cipher, CryptoError};

/// Key length in bytes.
pub const KEY_LEN: usize = 32;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Shared-key cipher for message bodies. The key is wiped on drop.
pub struct ChaChaCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl ChaChaCipher {
    /// Creates a cipher from raw key bytes.
    #[must_use]
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    /// Parses a key from 64 hexadecimal characters.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the string is not valid hex
    /// or does not decode to exactly 32 bytes.
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(
            hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?,
        );
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(key))
    }

    /// Generates a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        Self::from_bytes(key)
    }

    fn aead(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.key.as_slice()))
    }
}

impl std::fmt::Debug for ChaChaCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaCipher").finish_non_exhaustive()
    }
}

impl Cipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<SealedEnvelope, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .aead()
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        Ok(SealedEnvelope {
            version: SEALED_ENVELOPE_VERSION,
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    fn decrypt(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>, CryptoError> {
        if envelope.nonce.len() != NONCE_LEN {
            return Err(CryptoError::DecryptionFailed(format!(
                "nonce must be {NONCE_LEN} bytes, got {}",
                envelope.nonce.len()
            )));
        }
        self.aead()
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                envelope.ciphertext.as_slice(),
            )
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}
