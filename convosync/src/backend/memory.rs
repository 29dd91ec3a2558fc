//! In-process backend.
//!
//! Assigns sequence numbers per conversation, deduplicates sends by client
//! id and fans notifications out to connections over a
//! [`tokio::sync::broadcast`] channel. Fault injection hooks let tests
//! drop connections, reject or fail sends, and redeliver notifications.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use convosync_proto::conversation::Conversation;
use convosync_proto::message::{
    ClientId, ConversationId, MessageBody, PrincipalId, SequenceNumber, ServerId, ServerMessage,
    Timestamp,
};
use convosync_proto::notification::{
    ChangeKind, FetchRange, Notification, SendReceipt, SendRequest, Topic,
};
use convosync_proto::presence::{PresenceStatus, PresenceUpdate};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{Backend, BackendError, RealtimeConnection};

/// Capacity of the notification fan-out channel.
const FANOUT_CAPACITY: usize = 1024;

/// One event on the fan-out channel.
#[derive(Debug, Clone)]
enum Fanout {
    /// A notification for every connection subscribed to any of `topics`.
    Deliver {
        topics: Vec<Topic>,
        notification: Notification,
    },
    /// Every live connection is dropped.
    DropAll,
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    reject_next: Option<(u16, String)>,
    fail_next: u32,
    fail_next_fetches: u32,
    lose_next_receipt: bool,
}

#[derive(Debug, Default)]
struct State {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<ServerMessage>>,
    receipts: HashMap<ClientId, SendReceipt>,
    next_server_id: u64,
    faults: Faults,
    send_attempts: u64,
}

impl State {
    fn next_sequence(&self, conversation: &ConversationId) -> SequenceNumber {
        self.messages
            .get(conversation)
            .and_then(|msgs| msgs.last())
            .map_or(SequenceNumber::new(1), |m| m.sequence.next())
    }
}

/// Cloneable in-process backend. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    fanout: broadcast::Sender<Fanout>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            fanout,
        }
    }

    fn publish(&self, topics: Vec<Topic>, notification: Notification) {
        // No receivers simply means nobody is connected.
        let _ = self.fanout.send(Fanout::Deliver {
            topics,
            notification,
        });
    }

    fn principal_topics(conversation: &Conversation) -> Vec<Topic> {
        conversation
            .participants
            .iter()
            .cloned()
            .map(Topic::Principal)
            .collect()
    }

    /// Creates (or replaces) a conversation and notifies its participants.
    pub fn create_conversation(
        &self,
        id: ConversationId,
        participants: impl IntoIterator<Item = PrincipalId>,
    ) -> Conversation {
        let conversation = Conversation::new(id.clone(), participants, Timestamp::now());
        self.state
            .lock()
            .conversations
            .insert(id, conversation.clone());
        self.publish(
            Self::principal_topics(&conversation),
            Notification::Conversation(conversation.clone()),
        );
        conversation
    }

    /// Deletes a conversation and its messages.
    pub fn remove_conversation(&self, id: &ConversationId) {
        let removed = {
            let mut state = self.state.lock();
            state.messages.remove(id);
            state.conversations.remove(id)
        };
        if let Some(conversation) = removed {
            let mut topics = Self::principal_topics(&conversation);
            topics.push(Topic::Conversation(id.clone()));
            self.publish(topics, Notification::ConversationRemoved(id.clone()));
        }
    }

    /// Stores a plaintext message from `sender` and notifies subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Rejected`] if the conversation does not exist.
    pub fn post(
        &self,
        conversation: &ConversationId,
        sender: &PrincipalId,
        text: &str,
    ) -> Result<ServerMessage, BackendError> {
        self.store_message(conversation, sender, MessageBody::Plain(text.to_string()), None)
    }

    /// Stores a message without notifying anyone, as if the notification
    /// had been lost.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Rejected`] if the conversation does not exist.
    pub fn post_silently(
        &self,
        conversation: &ConversationId,
        sender: &PrincipalId,
        text: &str,
    ) -> Result<ServerMessage, BackendError> {
        self.insert_message(conversation, sender, MessageBody::Plain(text.to_string()), None)
    }

    fn store_message(
        &self,
        conversation: &ConversationId,
        sender: &PrincipalId,
        body: MessageBody,
        client_id: Option<ClientId>,
    ) -> Result<ServerMessage, BackendError> {
        let message = self.insert_message(conversation, sender, body, client_id)?;
        self.publish(
            vec![Topic::Conversation(conversation.clone())],
            Notification::Message {
                change: ChangeKind::Insert,
                message: message.clone(),
            },
        );
        Ok(message)
    }

    fn insert_message(
        &self,
        conversation: &ConversationId,
        sender: &PrincipalId,
        body: MessageBody,
        client_id: Option<ClientId>,
    ) -> Result<ServerMessage, BackendError> {
        let mut state = self.state.lock();
        if !state.conversations.contains_key(conversation) {
            return Err(BackendError::Rejected {
                code: 404,
                reason: format!("unknown conversation {conversation}"),
            });
        }
        state.next_server_id += 1;
        let message = ServerMessage {
            server_id: ServerId::new(format!("m{}", state.next_server_id)),
            client_id,
            conversation_id: conversation.clone(),
            sender_id: sender.clone(),
            body,
            sequence: state.next_sequence(conversation),
            created_at: Timestamp::now(),
            delivered: false,
        };
        state
            .messages
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());
        if let Some(conv) = state.conversations.get_mut(conversation) {
            conv.last_activity = message.created_at;
        }
        Ok(message)
    }

    /// Marks a message delivered and publishes the update.
    pub fn mark_delivered(&self, conversation: &ConversationId, sequence: SequenceNumber) {
        let updated = {
            let mut state = self.state.lock();
            state
                .messages
                .get_mut(conversation)
                .and_then(|msgs| msgs.iter_mut().find(|m| m.sequence == sequence))
                .map(|m| {
                    m.delivered = true;
                    m.clone()
                })
        };
        if let Some(message) = updated {
            self.publish(
                vec![Topic::Conversation(conversation.clone())],
                Notification::Message {
                    change: ChangeKind::Update,
                    message,
                },
            );
        }
    }

    /// Publishes a presence change to everyone sharing a conversation with
    /// `principal`.
    pub fn set_presence(&self, principal: &PrincipalId, status: PresenceStatus) {
        let topics: Vec<Topic> = {
            let state = self.state.lock();
            let peers: HashSet<&PrincipalId> = state
                .conversations
                .values()
                .filter(|c| c.has_participant(principal))
                .flat_map(|c| c.participants.iter())
                .collect();
            peers.into_iter().cloned().map(Topic::Principal).collect()
        };
        self.publish(
            topics,
            Notification::Presence(PresenceUpdate {
                principal: principal.clone(),
                status,
                at: Timestamp::now(),
            }),
        );
    }

    /// Publishes every stored message of `conversation` again.
    pub fn redeliver(&self, conversation: &ConversationId) {
        let messages = self
            .state
            .lock()
            .messages
            .get(conversation)
            .cloned()
            .unwrap_or_default();
        for message in messages {
            self.publish(
                vec![Topic::Conversation(conversation.clone())],
                Notification::Message {
                    change: ChangeKind::Update,
                    message,
                },
            );
        }
    }

    /// Drops every live realtime connection.
    pub fn disconnect_all(&self) {
        let _ = self.fanout.send(Fanout::DropAll);
    }

    /// While offline, every operation fails with
    /// [`BackendError::Unreachable`].
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().faults.offline = offline;
        if offline {
            self.disconnect_all();
        }
    }

    /// Rejects the next send permanently.
    pub fn reject_next_send(&self, code: u16, reason: impl Into<String>) {
        self.state.lock().faults.reject_next = Some((code, reason.into()));
    }

    /// Fails the next `count` sends with a timeout before storing them.
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().faults.fail_next = count;
    }

    /// Fails the next `count` message fetches with a timeout.
    pub fn fail_next_fetches(&self, count: u32) {
        self.state.lock().faults.fail_next_fetches = count;
    }

    /// Stores the next send but reports a timeout to the sender.
    pub fn lose_next_receipt(&self) {
        self.state.lock().faults.lose_next_receipt = true;
    }

    /// All stored messages of `conversation`, in sequence order.
    #[must_use]
    pub fn messages(&self, conversation: &ConversationId) -> Vec<ServerMessage> {
        self.state
            .lock()
            .messages
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of send requests received, including failed ones.
    #[must_use]
    pub fn send_attempts(&self) -> u64 {
        self.state.lock().send_attempts
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.state.lock().faults.offline {
            Err(BackendError::Unreachable("memory backend is offline".into()))
        } else {
            Ok(())
        }
    }
}

impl Backend for MemoryBackend {
    type Connection = MemoryConnection;

    async fn connect(&self, principal: &PrincipalId) -> Result<MemoryConnection, BackendError> {
        self.check_online()?;
        tracing::debug!(principal = %principal, "memory backend connection opened");
        Ok(MemoryConnection {
            events: self.fanout.subscribe(),
            topics: HashSet::new(),
            closed: false,
        })
    }

    async fn send_message(&self, request: SendRequest) -> Result<SendReceipt, BackendError> {
        let lose_receipt = {
            let mut state = self.state.lock();
            state.send_attempts += 1;
            if state.faults.offline {
                return Err(BackendError::Unreachable("memory backend is offline".into()));
            }
            if state.faults.fail_next > 0 {
                state.faults.fail_next -= 1;
                return Err(BackendError::Timeout);
            }
            if let Some((code, reason)) = state.faults.reject_next.take() {
                return Err(BackendError::Rejected { code, reason });
            }
            if let Some(receipt) = state.receipts.get(&request.client_id) {
                tracing::debug!(client_id = %request.client_id, "duplicate send deduplicated");
                return Ok(receipt.clone());
            }
            match state.conversations.get(&request.conversation_id) {
                None => {
                    return Err(BackendError::Rejected {
                        code: 404,
                        reason: format!("unknown conversation {}", request.conversation_id),
                    });
                }
                Some(conv) if !conv.has_participant(&request.sender_id) => {
                    return Err(BackendError::Rejected {
                        code: 403,
                        reason: "sender is not a participant".into(),
                    });
                }
                Some(_) => {}
            }
            std::mem::take(&mut state.faults.lose_next_receipt)
        };

        let message = self.store_message(
            &request.conversation_id,
            &request.sender_id,
            request.body,
            Some(request.client_id),
        )?;
        let receipt = SendReceipt {
            server_id: message.server_id,
            sequence: message.sequence,
            created_at: message.created_at,
        };
        self.state
            .lock()
            .receipts
            .insert(request.client_id, receipt.clone());
        if lose_receipt {
            return Err(BackendError::Timeout);
        }
        Ok(receipt)
    }

    async fn fetch_conversations(
        &self,
        principal: &PrincipalId,
    ) -> Result<Vec<Conversation>, BackendError> {
        self.check_online()?;
        let state = self.state.lock();
        Ok(state
            .conversations
            .values()
            .filter(|c| c.has_participant(principal))
            .cloned()
            .collect())
    }

    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        range: FetchRange,
    ) -> Result<Vec<ServerMessage>, BackendError> {
        self.check_online()?;
        let mut state = self.state.lock();
        if state.faults.fail_next_fetches > 0 {
            state.faults.fail_next_fetches -= 1;
            return Err(BackendError::Timeout);
        }
        if !state.conversations.contains_key(conversation) {
            return Err(BackendError::Rejected {
                code: 404,
                reason: format!("unknown conversation {conversation}"),
            });
        }
        Ok(state
            .messages
            .get(conversation)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| range.contains(m.sequence))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Realtime connection to a [`MemoryBackend`].
pub struct MemoryConnection {
    events: broadcast::Receiver<Fanout>,
    topics: HashSet<Topic>,
    closed: bool,
}

impl RealtimeConnection for MemoryConnection {
    async fn subscribe(&mut self, topic: Topic) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Disconnected);
        }
        self.topics.insert(topic);
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), BackendError> {
        self.topics.remove(topic);
        Ok(())
    }

    async fn next_notification(&mut self) -> Result<Notification, BackendError> {
        loop {
            if self.closed {
                return Err(BackendError::Disconnected);
            }
            match self.events.recv().await {
                Ok(Fanout::Deliver {
                    topics,
                    notification,
                }) => {
                    if topics.iter().any(|t| self.topics.contains(t)) {
                        return Ok(notification);
                    }
                }
                Ok(Fanout::DropAll) | Err(broadcast::error::RecvError::Closed) => {
                    self.closed = true;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed notifications can only be recovered by a resync.
                    tracing::warn!(skipped, "memory connection lagged, dropping");
                    self.closed = true;
                }
            }
        }
    }
}
