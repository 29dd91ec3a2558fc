//! Per-conversation sealing and opening of message bodies.

use std::sync::Arc;

use convosync_proto::message::{MessageBody, SEALED_ENVELOPE_VERSION, ServerMessage};

use super::{Cipher, CryptoError};
use crate::store::{DeliveryStatus, EncryptionTag, Message, MessageContent, UnavailableReason};

/// Decrypted (or placeholder) content plus its encryption disclosure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedBody {
    /// Displayable content.
    pub content: MessageContent,
    /// Whether the body travelled sealed.
    pub encryption: EncryptionTag,
}

/// Seals outgoing text and opens incoming bodies.
///
/// The encryption flag is fixed when the envelope is created, which
/// happens once per opened conversation.
#[derive(Clone)]
pub struct MessageEnvelope {
    enabled: bool,
    cipher: Option<Arc<dyn Cipher>>,
}

impl MessageEnvelope {
    /// Creates an envelope. `cipher` is required to seal when `enabled`
    /// and to open sealed bodies at all.
    #[must_use]
    pub fn new(enabled: bool, cipher: Option<Arc<dyn Cipher>>) -> Self {
        Self { enabled, cipher }
    }

    /// An envelope that never seals and cannot open sealed bodies.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            cipher: None,
        }
    }

    /// Returns `true` if outgoing text is sealed.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The tag outgoing messages carry.
    #[must_use]
    pub const fn outgoing_tag(&self) -> EncryptionTag {
        if self.enabled {
            EncryptionTag::Encrypted
        } else {
            EncryptionTag::Unencrypted
        }
    }

    /// Seals `text`, or wraps it as plain when encryption is off.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::MissingKey`] if encryption is on without a
    /// cipher, or the cipher's error if sealing fails.
    pub fn seal(&self, text: &str) -> Result<MessageBody, CryptoError> {
        if !self.enabled {
            return Ok(MessageBody::Plain(text.to_string()));
        }
        let cipher = self.cipher.as_ref().ok_or(CryptoError::MissingKey)?;
        cipher.encrypt(text.as_bytes()).map(MessageBody::Sealed)
    }

    /// Opens a body. Never fails: content that cannot be shown becomes
    /// [`MessageContent::Unavailable`].
    #[must_use]
    pub fn open(&self, body: &MessageBody) -> OpenedBody {
        let sealed = match body {
            MessageBody::Plain(text) => {
                return OpenedBody {
                    content: MessageContent::Text(text.clone()),
                    encryption: EncryptionTag::Unencrypted,
                };
            }
            MessageBody::Sealed(sealed) => sealed,
        };
        let unavailable = |reason| OpenedBody {
            content: MessageContent::Unavailable(reason),
            encryption: EncryptionTag::Encrypted,
        };

        if sealed.version != SEALED_ENVELOPE_VERSION {
            return unavailable(UnavailableReason::UnsupportedEnvelope(sealed.version));
        }
        let Some(cipher) = self.cipher.as_ref().filter(|_| self.enabled) else {
            return unavailable(UnavailableReason::EncryptionDisabled);
        };
        match cipher.decrypt(sealed).map(String::from_utf8) {
            Ok(Ok(text)) => OpenedBody {
                content: MessageContent::Text(text),
                encryption: EncryptionTag::Encrypted,
            },
            Ok(Err(_)) => {
                tracing::warn!("decrypted body is not valid UTF-8");
                unavailable(UnavailableReason::DecryptionFailed)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open sealed body");
                unavailable(UnavailableReason::DecryptionFailed)
            }
        }
    }

    /// Converts a backend message into its store representation.
    #[must_use]
    pub fn open_message(&self, message: ServerMessage) -> Message {
        let opened = self.open(&message.body);
        Message {
            client_id: message.client_id,
            server_id: Some(message.server_id),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: opened.content,
            encryption: opened.encryption,
            sequence: Some(message.sequence),
            status: if message.delivered {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Sent
            },
            created_at: message.created_at,
        }
    }
}

impl std::fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("enabled", &self.enabled)
            .field("has_cipher", &self.cipher.is_some())
            .finish()
    }
}
