//! Conversation metadata.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, PrincipalId, Timestamp};

/// Conversation metadata as published by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation identifier.
    pub id: ConversationId,
    /// Participants, ordered by id.
    pub participants: BTreeSet<PrincipalId>,
    /// Preview of the most recent message, if any.
    pub last_message_preview: Option<String>,
    /// Unread messages for the viewing principal.
    pub unread_count: u32,
    /// Time of the most recent activity in the conversation.
    pub last_activity: Timestamp,
}

impl Conversation {
    /// Creates a conversation with no messages.
    pub fn new(
        id: ConversationId,
        participants: impl IntoIterator<Item = PrincipalId>,
        last_activity: Timestamp,
    ) -> Self {
        Self {
            id,
            participants: participants.into_iter().collect(),
            last_message_preview: None,
            unread_count: 0,
            last_activity,
        }
    }

    /// Returns `true` if `principal` participates in this conversation.
    #[must_use]
    pub fn has_participant(&self, principal: &PrincipalId) -> bool {
        self.participants.contains(principal)
    }
}
