//! Realtime change notifications and the request/response shapes of the
//! backend contract.

use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::message::{
    ClientId, ConversationId, MessageBody, PrincipalId, SequenceNumber, ServerId, ServerMessage,
    Timestamp,
};
use crate::presence::PresenceUpdate;

/// A subscription topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    /// Message changes within one conversation.
    Conversation(ConversationId),
    /// Conversation-list changes for one principal.
    Principal(PrincipalId),
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Principal(id) => write!(f, "principal:{id}"),
        }
    }
}

/// Whether a message notification reports a new row or a changed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A message was inserted.
    Insert,
    /// An existing message changed (e.g. delivery status).
    Update,
}

/// A change notification delivered at least once by the realtime backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// A message was inserted or updated.
    Message {
        /// Insert or update.
        change: ChangeKind,
        /// The message as stored by the backend.
        message: ServerMessage,
    },
    /// Conversation metadata changed.
    Conversation(Conversation),
    /// A conversation was deleted.
    ConversationRemoved(ConversationId),
    /// A principal's presence changed.
    Presence(PresenceUpdate),
}

impl Notification {
    /// The conversation this notification concerns, if any.
    #[must_use]
    pub const fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Message { message, .. } => Some(&message.conversation_id),
            Self::Conversation(conv) => Some(&conv.id),
            Self::ConversationRemoved(id) => Some(id),
            Self::Presence(_) => None,
        }
    }
}

/// Request body of the send contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: PrincipalId,
    /// Plain or sealed body.
    pub body: MessageBody,
    /// Client id; the backend deduplicates on it.
    pub client_id: ClientId,
}

/// Response body of the send contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Canonical id assigned by the backend.
    pub server_id: ServerId,
    /// Sequence number assigned by the backend.
    pub sequence: SequenceNumber,
    /// When the backend accepted the message.
    pub created_at: Timestamp,
}

/// Range of messages requested from the backend.
///
/// Bounds are exclusive; `None` leaves that side open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRange {
    /// Only messages with a sequence strictly greater than this.
    pub after: Option<SequenceNumber>,
    /// Only messages with a sequence strictly less than this.
    pub before: Option<SequenceNumber>,
}

impl FetchRange {
    /// The whole conversation.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            after: None,
            before: None,
        }
    }

    /// Messages strictly between `after` and `before`.
    #[must_use]
    pub const fn between(after: SequenceNumber, before: SequenceNumber) -> Self {
        Self {
            after: Some(after),
            before: Some(before),
        }
    }

    /// Returns `true` if `sequence` falls inside this range.
    #[must_use]
    pub fn contains(&self, sequence: SequenceNumber) -> bool {
        self.after.is_none_or(|after| sequence > after)
            && self.before.is_none_or(|before| sequence < before)
    }
}
