//! Message types held by the conversation store.

use convosync_proto::message::{
    ClientId, ConversationId, PrincipalId, SequenceNumber, ServerId, Timestamp,
};
use convosync_proto::notification::SendReceipt;

/// Maximum length of a conversation preview, in characters.
const PREVIEW_CHARS: usize = 80;

/// Why a send attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The backend could not be reached or the connection dropped.
    Network(String),
    /// The backend refused the message.
    Rejected {
        /// Backend status code.
        code: u16,
        /// Backend explanation.
        reason: String,
    },
    /// The body could not be sealed.
    Encryption(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(e) => write!(f, "network error: {e}"),
            Self::Rejected { code, reason } => write!(f, "rejected ({code}): {reason}"),
            Self::Encryption(e) => write!(f, "encryption failed: {e}"),
        }
    }
}

/// Delivery status of a message.
///
/// `Pending -> Sent -> Delivered`, or `Pending -> Failed`. A failed message
/// can be re-armed to `Pending` by an explicit retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Shown optimistically, not yet confirmed by the backend.
    Pending,
    /// Accepted by the backend.
    Sent,
    /// Delivered to the other participants.
    Delivered,
    /// The send attempt failed; the entry stays visible for retry.
    Failed(FailureReason),
}

impl DeliveryStatus {
    const fn rank(&self) -> u8 {
        match self {
            Self::Pending | Self::Failed(_) => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
        }
    }

    /// Returns the later of two statuses; confirmation never moves backwards.
    #[must_use]
    pub fn advance(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    /// Returns `true` once the backend has accepted the message.
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.rank() > 0
    }

    /// Returns `true` for failed sends.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Why message content cannot be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The sealed body could not be opened with the local key.
    DecryptionFailed,
    /// The body is sealed but encryption is turned off on this client.
    EncryptionDisabled,
    /// The envelope format version is not understood.
    UnsupportedEnvelope(u8),
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DecryptionFailed => f.write_str("could not be decrypted"),
            Self::EncryptionDisabled => f.write_str("is encrypted and encryption is off"),
            Self::UnsupportedEnvelope(v) => write!(f, "uses unsupported envelope v{v}"),
        }
    }
}

/// Displayable content of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Plaintext.
    Text(String),
    /// Content exists but cannot be shown.
    Unavailable(UnavailableReason),
}

impl MessageContent {
    /// Short single-line preview for conversation lists.
    #[must_use]
    pub fn preview(&self) -> String {
        match self {
            Self::Text(text) => {
                let line = text.lines().next().unwrap_or_default();
                if line.chars().count() > PREVIEW_CHARS {
                    let mut cut: String = line.chars().take(PREVIEW_CHARS).collect();
                    cut.push('\u{2026}');
                    cut
                } else {
                    line.to_string()
                }
            }
            Self::Unavailable(_) => "[content unavailable]".to_string(),
        }
    }

    /// Returns the text if available.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Unavailable(_) => None,
        }
    }
}

/// Whether a message travelled sealed, for UI disclosure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionTag {
    /// Sealed by the encryption envelope.
    Encrypted,
    /// Sent in the clear.
    Unencrypted,
}

/// A message in the store.
///
/// Optimistic entries carry only a client id; once the backend confirms
/// them both ids are retained as an alias pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Device-generated id, if known.
    pub client_id: Option<ClientId>,
    /// Canonical id, once assigned.
    pub server_id: Option<ServerId>,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: PrincipalId,
    /// Displayable content.
    pub content: MessageContent,
    /// Encryption disclosure.
    pub encryption: EncryptionTag,
    /// Backend order key, once assigned.
    pub sequence: Option<SequenceNumber>,
    /// Delivery status.
    pub status: DeliveryStatus,
    /// Creation time (backend time once confirmed).
    pub created_at: Timestamp,
}

impl Message {
    /// Builds the optimistic entry for a draft.
    #[must_use]
    pub fn optimistic(client_id: ClientId, draft: &Draft) -> Self {
        Self {
            client_id: Some(client_id),
            server_id: None,
            conversation_id: draft.conversation_id.clone(),
            sender_id: draft.sender_id.clone(),
            content: MessageContent::Text(draft.text.clone()),
            encryption: draft.encryption,
            sequence: None,
            status: DeliveryStatus::Pending,
            created_at: draft.created_at,
        }
    }

    /// Applies a send receipt to an optimistic entry.
    pub fn confirm(&mut self, receipt: &SendReceipt) {
        self.server_id = Some(receipt.server_id.clone());
        self.sequence = Some(receipt.sequence);
        self.created_at = receipt.created_at;
        self.status = std::mem::replace(&mut self.status, DeliveryStatus::Pending)
            .advance(DeliveryStatus::Sent);
    }

    /// Merges a server version into this entry. The server version wins;
    /// the client id alias and the furthest delivery status survive.
    #[must_use]
    pub fn merged_with(self, incoming: Self) -> Self {
        Self {
            client_id: self.client_id.or(incoming.client_id),
            status: self.status.advance(incoming.status),
            ..incoming
        }
    }
}

/// Text the user asked to send, before the backend has seen it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: PrincipalId,
    /// Plaintext body.
    pub text: String,
    /// Whether the body will be sealed.
    pub encryption: EncryptionTag,
    /// Local creation time.
    pub created_at: Timestamp,
}

/// Result of a send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The backend accepted the message.
    Sent(SendReceipt),
    /// The attempt failed.
    Failed(FailureReason),
}
