//! Client-side conversation store.
//!
//! [`ConversationStore`] is a reducer: every [`Action`] produces a valid
//! next state plus a list of [`StoreEffect`]s the caller should carry out.
//! It never fails; problems are recorded in the data itself (delivery
//! status, unavailable content).
//!
//! Ordering and merge rules live in [`timeline`]; this module owns the
//! conversation metadata, unread counters and routing of actions to the
//! right timeline.

pub mod handle;
pub mod message;
pub mod timeline;

use std::collections::{HashMap, HashSet};

use convosync_proto::conversation::Conversation;
use convosync_proto::message::{ClientId, ConversationId, PrincipalId, SequenceNumber};

pub use handle::{EffectReceiver, StoreHandle};
pub use message::{
    DeliveryStatus, Draft, EncryptionTag, FailureReason, Message, MessageContent, SendOutcome,
    UnavailableReason,
};
use timeline::{Gap, Timeline};

/// Inputs to the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Upsert conversation metadata. Conversations not listed are kept.
    LoadConversations(Vec<Conversation>),
    /// Merge a message from the backend.
    UpsertMessage(Message),
    /// Show (or re-arm) the optimistic entry for an outgoing message.
    MarkSendPending {
        /// Device-generated id of the send intent.
        client_id: ClientId,
        /// What is being sent.
        draft: Draft,
    },
    /// Record the outcome of a send attempt.
    MarkSendResult {
        /// Id of the send intent.
        client_id: ClientId,
        /// Backend receipt or failure.
        outcome: SendOutcome,
    },
    /// Mark everything rendered in a conversation as read.
    MarkRead(ConversationId),
    /// Drop a conversation and its messages.
    RemoveConversation(ConversationId),
    /// Render held messages below `before`, treating the still-missing
    /// sequence numbers as permanently absent.
    ReleaseHeld {
        /// Conversation to release.
        conversation_id: ConversationId,
        /// Exclusive upper bound.
        before: SequenceNumber,
    },
    /// A backfill for this conversation failed; ask for its open gap again.
    RetryBackfill(ConversationId),
}

/// Work the reducer asks the caller to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEffect {
    /// Fetch the messages strictly between `after` and `before`.
    RequestBackfill {
        /// Conversation with the gap.
        conversation: ConversationId,
        /// Last rendered sequence number.
        after: SequenceNumber,
        /// First held sequence number.
        before: SequenceNumber,
    },
    /// Fetch a conversation the store does not know and its messages.
    ResyncConversation(ConversationId),
}

impl StoreEffect {
    fn backfill(conversation: &ConversationId, gap: Gap) -> Self {
        Self::RequestBackfill {
            conversation: conversation.clone(),
            after: gap.after,
            before: gap.before,
        }
    }
}

/// Conversations and their timelines, as seen by one principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationStore {
    viewer: PrincipalId,
    conversations: HashMap<ConversationId, Conversation>,
    timelines: HashMap<ConversationId, Timeline>,
    tombstones: HashSet<ConversationId>,
    client_conversations: HashMap<ClientId, ConversationId>,
    resync_requested: HashSet<ConversationId>,
}

impl ConversationStore {
    /// Creates an empty store for `viewer`.
    #[must_use]
    pub fn new(viewer: PrincipalId) -> Self {
        Self {
            viewer,
            conversations: HashMap::new(),
            timelines: HashMap::new(),
            tombstones: HashSet::new(),
            client_conversations: HashMap::new(),
            resync_requested: HashSet::new(),
        }
    }

    /// The principal whose view this is.
    #[must_use]
    pub const fn viewer(&self) -> &PrincipalId {
        &self.viewer
    }

    /// Applies `action` by value and returns the next state.
    #[must_use]
    pub fn reduce(mut self, action: Action) -> (Self, Vec<StoreEffect>) {
        let effects = self.apply(action);
        (self, effects)
    }

    /// Applies `action` in place.
    pub fn apply(&mut self, action: Action) -> Vec<StoreEffect> {
        match action {
            Action::LoadConversations(list) => {
                self.load_conversations(list);
                Vec::new()
            }
            Action::UpsertMessage(message) => self.upsert_message(message),
            Action::MarkSendPending { client_id, draft } => self.mark_pending(client_id, draft),
            Action::MarkSendResult { client_id, outcome } => {
                self.mark_result(client_id, outcome)
            }
            Action::MarkRead(id) => {
                if let Some(timeline) = self.timelines.get_mut(&id) {
                    timeline.mark_read();
                    self.refresh(&id);
                }
                Vec::new()
            }
            Action::RemoveConversation(id) => {
                self.conversations.remove(&id);
                self.timelines.remove(&id);
                self.client_conversations.retain(|_, conv| conv != &id);
                self.resync_requested.remove(&id);
                self.tombstones.insert(id);
                Vec::new()
            }
            Action::ReleaseHeld {
                conversation_id,
                before,
            } => {
                let Some(timeline) = self.timelines.get_mut(&conversation_id) else {
                    return Vec::new();
                };
                let gap = timeline.release_held(before);
                self.refresh(&conversation_id);
                gap.map(|g| StoreEffect::backfill(&conversation_id, g))
                    .into_iter()
                    .collect()
            }
            Action::RetryBackfill(id) => self
                .timelines
                .get_mut(&id)
                .and_then(Timeline::retry_gap)
                .map(|g| StoreEffect::backfill(&id, g))
                .into_iter()
                .collect(),
        }
    }

    fn load_conversations(&mut self, list: Vec<Conversation>) {
        for incoming in list {
            let id = incoming.id.clone();
            self.tombstones.remove(&id);
            self.resync_requested.remove(&id);
            let timeline = self.timelines.entry(id.clone()).or_default();
            // Local pending sends say nothing about what the server holds,
            // so only confirmed messages override the unread hint.
            let has_confirmed = timeline.has_confirmed();
            let has_messages = timeline.rendered_len() > 0;

            match self.conversations.get_mut(&id) {
                Some(existing) => {
                    existing.participants = incoming.participants;
                    existing.last_activity = existing.last_activity.max(incoming.last_activity);
                    if !has_confirmed {
                        existing.unread_count = incoming.unread_count;
                    }
                    if !has_messages {
                        existing.last_message_preview = incoming.last_message_preview;
                    }
                }
                None => {
                    self.conversations.insert(id.clone(), incoming);
                }
            }
            if has_messages {
                self.refresh(&id);
            }
        }
    }

    fn upsert_message(&mut self, message: Message) -> Vec<StoreEffect> {
        let id = message.conversation_id.clone();
        if self.tombstones.contains(&id) {
            tracing::debug!(conversation = %id, "ignoring message for removed conversation");
            return Vec::new();
        }
        if !self.conversations.contains_key(&id) {
            return self.request_resync(id);
        }

        let gap = self.timelines.entry(id.clone()).or_default().upsert(message);
        self.refresh(&id);
        gap.map(|g| StoreEffect::backfill(&id, g))
            .into_iter()
            .collect()
    }

    fn mark_pending(&mut self, client_id: ClientId, draft: Draft) -> Vec<StoreEffect> {
        let id = draft.conversation_id.clone();
        if self.tombstones.contains(&id) {
            tracing::warn!(conversation = %id, %client_id, "send into removed conversation ignored");
            return Vec::new();
        }
        let mut effects = Vec::new();
        if !self.conversations.contains_key(&id) {
            // Sending into a conversation the list has not loaded yet.
            let placeholder = Conversation::new(
                id.clone(),
                [draft.sender_id.clone()],
                draft.created_at,
            );
            self.conversations.insert(id.clone(), placeholder);
            effects.extend(self.request_resync(id.clone()));
        }

        let entry = Message::optimistic(client_id, &draft);
        let timeline = self.timelines.entry(id.clone()).or_default();
        if timeline.push_pending(entry) {
            self.client_conversations.insert(client_id, id.clone());
            self.refresh(&id);
        } else {
            tracing::debug!(%client_id, "pending entry already present");
        }
        effects
    }

    fn mark_result(&mut self, client_id: ClientId, outcome: SendOutcome) -> Vec<StoreEffect> {
        let Some(id) = self.client_conversations.get(&client_id).cloned() else {
            tracing::debug!(%client_id, "send result for unknown entry");
            return Vec::new();
        };
        let Some(timeline) = self.timelines.get_mut(&id) else {
            return Vec::new();
        };
        let gap = match outcome {
            SendOutcome::Sent(receipt) => timeline.confirm_local(client_id, &receipt),
            SendOutcome::Failed(reason) => {
                if !timeline.fail_local(client_id, reason) {
                    tracing::debug!(%client_id, "failure for confirmed message ignored");
                }
                None
            }
        };
        self.refresh(&id);
        gap.map(|g| StoreEffect::backfill(&id, g))
            .into_iter()
            .collect()
    }

    fn request_resync(&mut self, id: ConversationId) -> Vec<StoreEffect> {
        if self.resync_requested.insert(id.clone()) {
            tracing::debug!(conversation = %id, "unknown conversation, requesting resync");
            vec![StoreEffect::ResyncConversation(id)]
        } else {
            Vec::new()
        }
    }

    /// Recomputes the derived fields of a conversation from its timeline.
    fn refresh(&mut self, id: &ConversationId) {
        let (Some(conversation), Some(timeline)) =
            (self.conversations.get_mut(id), self.timelines.get(id))
        else {
            return;
        };
        if let Some(last) = timeline.rendered().last() {
            if last.created_at >= conversation.last_activity {
                conversation.last_activity = last.created_at;
            }
            conversation.last_message_preview = Some(last.content.preview());
        }
        if timeline.has_confirmed() {
            conversation.unread_count = timeline.unread_for(&self.viewer);
        }
    }

    /// Looks up a conversation.
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// All conversations, most recently active first.
    #[must_use]
    pub fn conversations(&self) -> Vec<&Conversation> {
        let mut list: Vec<&Conversation> = self.conversations.values().collect();
        list.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Messages of a conversation in render order.
    #[must_use]
    pub fn messages(&self, id: &ConversationId) -> Vec<&Message> {
        self.timelines
            .get(id)
            .map(|t| t.rendered().collect())
            .unwrap_or_default()
    }

    /// Number of messages held behind a gap.
    #[must_use]
    pub fn held_count(&self, id: &ConversationId) -> usize {
        self.timelines.get(id).map_or(0, Timeline::held_len)
    }

    /// Highest rendered sequence number of a conversation.
    #[must_use]
    pub fn last_sequence(&self, id: &ConversationId) -> Option<SequenceNumber> {
        self.timelines.get(id).and_then(Timeline::last_sequence)
    }

    /// Finds a message by the client id of its send intent.
    #[must_use]
    pub fn message_by_client_id(&self, client_id: &ClientId) -> Option<&Message> {
        let id = self.client_conversations.get(client_id)?;
        self.timelines.get(id)?.find_by_client(client_id)
    }

    /// Sum of unread counters across conversations.
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.conversations
            .values()
            .map(|c| c.unread_count)
            .fold(0, u32::saturating_add)
    }

    /// Returns `true` if `id` was removed and not reloaded since.
    #[must_use]
    pub fn is_removed(&self, id: &ConversationId) -> bool {
        self.tombstones.contains(id)
    }
}
