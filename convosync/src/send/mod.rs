//! Outgoing message pipeline.
//!
//! A send shows the message in the store immediately (optimistic entry),
//! seals it, and submits it on a background task. The outcome is always
//! fed back to the store as an action, whether or not anyone still waits
//! for the [`SendTicket`].
//!
//! ```text
//! validate -> MarkSendPending -> seal -> submit (spawned) -> MarkSendResult
//! ```

use std::sync::Arc;

use convosync_proto::message::{
    ClientId, ConversationId, PrincipalId, Timestamp, ValidationError, validate_text,
};
use convosync_proto::notification::SendRequest;
use tokio::sync::oneshot;

use crate::backend::{Backend, BackendError};
use crate::crypto::{Cipher, MessageEnvelope};
use crate::error::ErrorKind;
use crate::store::{Action, DeliveryStatus, Draft, FailureReason, SendOutcome, StoreHandle};

/// Errors returned synchronously by the send pipeline.
///
/// Failures after the optimistic entry exists are not errors here; they are
/// recorded in the store and reported through the [`SendTicket`].
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The text failed validation; nothing was recorded.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// No message with this client id exists in the conversation.
    #[error("unknown message {0}")]
    UnknownMessage(ClientId),

    /// Only failed messages can be retried.
    #[error("message {0} has not failed and cannot be retried")]
    NotRetryable(ClientId),
}

impl SendError {
    /// Maps this error onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::UnknownMessage(_) | Self::NotRetryable(_) => {
                ErrorKind::InvalidInput
            }
        }
    }
}

impl From<BackendError> for FailureReason {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected { code, reason } => Self::Rejected { code, reason },
            other => Self::Network(other.to_string()),
        }
    }
}

/// Receipt for a send in flight.
///
/// Dropping the ticket only discards the notification; the store still
/// records the outcome.
#[derive(Debug)]
pub struct SendTicket {
    client_id: ClientId,
    outcome: oneshot::Receiver<SendOutcome>,
}

impl SendTicket {
    /// Id of the send intent, usable with [`ConversationSender::retry`].
    #[must_use]
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Waits for the outcome. Returns `None` if the submitting task was
    /// cancelled before it finished.
    pub async fn outcome(self) -> Option<SendOutcome> {
        self.outcome.await.ok()
    }
}

/// Creates [`ConversationSender`]s for one principal.
pub struct SendPipeline<B: Backend> {
    backend: Arc<B>,
    store: StoreHandle,
    sender: PrincipalId,
    encryption_enabled: bool,
    cipher: Option<Arc<dyn Cipher>>,
}

impl<B: Backend> SendPipeline<B> {
    /// Creates a pipeline sending as `sender`.
    #[must_use]
    pub fn new(
        backend: Arc<B>,
        store: StoreHandle,
        sender: PrincipalId,
        encryption_enabled: bool,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Self {
        Self {
            backend,
            store,
            sender,
            encryption_enabled,
            cipher,
        }
    }

    /// Changes whether conversations opened from now on are sealed.
    /// Already open conversations keep their setting.
    pub const fn set_encryption_enabled(&mut self, enabled: bool) {
        self.encryption_enabled = enabled;
    }

    /// Opens `conversation` for sending. The encryption setting is fixed
    /// for the lifetime of the returned sender.
    #[must_use]
    pub fn open_conversation(&self, conversation: ConversationId) -> ConversationSender<B> {
        let envelope = MessageEnvelope::new(self.encryption_enabled, self.cipher.clone());
        tracing::debug!(
            %conversation,
            encrypted = envelope.is_enabled(),
            "conversation opened for sending"
        );
        ConversationSender {
            backend: Arc::clone(&self.backend),
            store: self.store.clone(),
            sender: self.sender.clone(),
            conversation,
            envelope,
        }
    }
}

impl<B: Backend> std::fmt::Debug for SendPipeline<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPipeline")
            .field("sender", &self.sender)
            .field("encryption_enabled", &self.encryption_enabled)
            .finish_non_exhaustive()
    }
}

/// Sends messages into one conversation.
pub struct ConversationSender<B: Backend> {
    backend: Arc<B>,
    store: StoreHandle,
    sender: PrincipalId,
    conversation: ConversationId,
    envelope: MessageEnvelope,
}

impl<B: Backend> ConversationSender<B> {
    /// The target conversation.
    #[must_use]
    pub const fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Whether messages sent here are sealed.
    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.envelope.is_enabled()
    }

    /// Sends `text`.
    ///
    /// The optimistic entry is in the store when this returns.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Validation`] for empty or oversized text; the
    /// store is left untouched in that case.
    pub fn send(&self, text: &str) -> Result<SendTicket, SendError> {
        validate_text(text)?;
        let client_id = ClientId::new();
        Ok(self.submit(client_id, text.to_string(), Timestamp::now()))
    }

    /// Resubmits a failed message with its original client id.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::UnknownMessage`] if the id is not a message of
    /// this conversation, or [`SendError::NotRetryable`] unless the message
    /// is in the failed state with readable text.
    pub fn retry(&self, client_id: ClientId) -> Result<SendTicket, SendError> {
        let (text, created_at) = self.store.read(|store| {
            let message = store
                .message_by_client_id(&client_id)
                .filter(|m| m.conversation_id == self.conversation)
                .ok_or(SendError::UnknownMessage(client_id))?;
            if !matches!(message.status, DeliveryStatus::Failed(_)) {
                return Err(SendError::NotRetryable(client_id));
            }
            let text = message
                .content
                .as_text()
                .ok_or(SendError::NotRetryable(client_id))?;
            Ok((text.to_string(), message.created_at))
        })?;
        tracing::info!(%client_id, conversation = %self.conversation, "retrying send");
        Ok(self.submit(client_id, text, created_at))
    }

    fn submit(&self, client_id: ClientId, text: String, created_at: Timestamp) -> SendTicket {
        let (tx, rx) = oneshot::channel();
        let ticket = SendTicket {
            client_id,
            outcome: rx,
        };

        let body = self.envelope.seal(&text);
        self.store.dispatch(Action::MarkSendPending {
            client_id,
            draft: Draft {
                conversation_id: self.conversation.clone(),
                sender_id: self.sender.clone(),
                text,
                encryption: self.envelope.outgoing_tag(),
                created_at,
            },
        });

        let body = match body {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(%client_id, error = %e, "could not seal message");
                let outcome = SendOutcome::Failed(FailureReason::Encryption(e.to_string()));
                self.store.dispatch(Action::MarkSendResult {
                    client_id,
                    outcome: outcome.clone(),
                });
                let _ = tx.send(outcome);
                return ticket;
            }
        };

        let request = SendRequest {
            conversation_id: self.conversation.clone(),
            sender_id: self.sender.clone(),
            body,
            client_id,
        };
        let backend = Arc::clone(&self.backend);
        let store = self.store.clone();
        tokio::spawn(async move {
            let outcome = match backend.send_message(request).await {
                Ok(receipt) => {
                    tracing::debug!(
                        %client_id,
                        server_id = %receipt.server_id,
                        sequence = %receipt.sequence,
                        "message sent"
                    );
                    SendOutcome::Sent(receipt)
                }
                Err(e) => {
                    tracing::warn!(%client_id, error = %e, "send failed");
                    SendOutcome::Failed(FailureReason::from(e))
                }
            };
            store.dispatch(Action::MarkSendResult {
                client_id,
                outcome: outcome.clone(),
            });
            // The view may be gone; the store already has the outcome.
            let _ = tx.send(outcome);
        });
        ticket
    }
}

impl<B: Backend> std::fmt::Debug for ConversationSender<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSender")
            .field("conversation", &self.conversation)
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}
