//! WebSocket wire frames exchanged with a realtime backend.
//!
//! Every frame travels as one postcard-encoded WebSocket binary message.
//! The first frame on a connection is always [`ClientFrame::Hello`]; the
//! backend answers with [`ServerFrame::Welcome`] before anything else.
//! Requests carry a client-chosen id that the matching
//! [`ServerFrame::Response`] echoes back.

use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::message::{ConversationId, PrincipalId, ServerMessage};
use crate::notification::{FetchRange, Notification, SendReceipt, SendRequest, Topic};

/// Frames sent from the client to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Identifies the connecting principal.
    Hello {
        /// The authenticated principal.
        principal: PrincipalId,
    },
    /// Start receiving notifications for a topic.
    Subscribe(Topic),
    /// Stop receiving notifications for a topic.
    Unsubscribe(Topic),
    /// A correlated request.
    Request {
        /// Client-chosen correlation id.
        id: u64,
        /// The request.
        request: Request,
    },
}

/// Request payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Submit a message.
    Send(SendRequest),
    /// List the principal's conversations.
    FetchConversations(PrincipalId),
    /// Fetch messages of one conversation within a range.
    FetchMessages {
        /// Conversation to read.
        conversation: ConversationId,
        /// Exclusive sequence bounds.
        range: FetchRange,
    },
}

/// Frames sent from the backend to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Handshake acknowledgment.
    Welcome {
        /// The principal echoed back.
        principal: PrincipalId,
    },
    /// A change notification for a subscribed topic.
    Notification(Notification),
    /// Response to a correlated request.
    Response {
        /// Correlation id from the request.
        id: u64,
        /// The response.
        response: Response,
    },
    /// Connection-level error; the backend closes the socket after sending it.
    Error {
        /// Human-readable description.
        reason: String,
    },
}

/// Response payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The message was accepted.
    Sent(SendReceipt),
    /// Conversation list.
    Conversations(Vec<Conversation>),
    /// Message page.
    Messages(Vec<ServerMessage>),
    /// The backend refused the request permanently.
    Rejected {
        /// Backend status code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}
