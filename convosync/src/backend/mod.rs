//! Data and realtime backend abstraction.
//!
//! The [`Backend`] trait covers the request/response contracts (send,
//! fetch) and opens [`RealtimeConnection`]s that deliver change
//! notifications at least once. Implementations:
//! - [`memory::MemoryBackend`]: in-process backend for tests and demos
//! - [`ws::WsBackend`]: WebSocket client speaking the postcard wire protocol

pub mod memory;
pub mod ws;

use std::future::Future;

use convosync_proto::conversation::Conversation;
use convosync_proto::message::{ConversationId, PrincipalId, ServerMessage};
use convosync_proto::notification::{FetchRange, Notification, SendReceipt, SendRequest, Topic};

use crate::error::ErrorKind;

/// Errors that can occur talking to the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The connection was closed.
    #[error("connection closed")]
    Disconnected,

    /// The operation did not complete in time.
    #[error("backend operation timed out")]
    Timeout,

    /// The backend could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend refused the request.
    #[error("rejected ({code}): {reason}")]
    Rejected {
        /// Backend status code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },

    /// The backend sent something that does not follow the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Returns `true` if the operation may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// Maps this error onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Disconnected | Self::Timeout | Self::Unreachable(_) | Self::Protocol(_) => {
                ErrorKind::TransientNetwork
            }
            Self::Rejected { .. } => ErrorKind::PermanentRejection,
        }
    }
}

/// A live subscription channel to the realtime backend.
///
/// Delivery is at least once: the same notification may arrive more than
/// once and consumers must merge idempotently.
pub trait RealtimeConnection: Send + 'static {
    /// Starts receiving notifications for `topic`.
    fn subscribe(
        &mut self,
        topic: Topic,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Stops receiving notifications for `topic`.
    fn unsubscribe(
        &mut self,
        topic: &Topic,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Waits for the next notification.
    ///
    /// Returns [`BackendError::Disconnected`] once the connection is lost;
    /// the connection is unusable afterwards.
    fn next_notification(
        &mut self,
    ) -> impl Future<Output = Result<Notification, BackendError>> + Send;
}

/// Request/response access to the backend plus realtime connections.
pub trait Backend: Send + Sync + 'static {
    /// Connection type returned by [`Backend::connect`].
    type Connection: RealtimeConnection;

    /// Opens a realtime connection for `principal`.
    fn connect(
        &self,
        principal: &PrincipalId,
    ) -> impl Future<Output = Result<Self::Connection, BackendError>> + Send;

    /// Submits a message. Submitting the same client id twice yields the
    /// same receipt and a single stored message.
    fn send_message(
        &self,
        request: SendRequest,
    ) -> impl Future<Output = Result<SendReceipt, BackendError>> + Send;

    /// Lists the conversations `principal` participates in.
    fn fetch_conversations(
        &self,
        principal: &PrincipalId,
    ) -> impl Future<Output = Result<Vec<Conversation>, BackendError>> + Send;

    /// Fetches messages of `conversation` inside `range`, in sequence order.
    fn fetch_messages(
        &self,
        conversation: &ConversationId,
        range: FetchRange,
    ) -> impl Future<Output = Result<Vec<ServerMessage>, BackendError>> + Send;
}
