//! WebSocket backend client.
//!
//! Every frame is a postcard-encoded [`ClientFrame`] or [`ServerFrame`]
//! carried in one binary WebSocket message. Requests are correlated with
//! responses by a client-chosen id. Each [`Backend::connect`] opens its own
//! socket for realtime notifications; requests share one lazily opened
//! socket that is reopened after it drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use convosync_proto::codec;
use convosync_proto::conversation::Conversation;
use convosync_proto::message::{ConversationId, PrincipalId, ServerMessage};
use convosync_proto::notification::{FetchRange, Notification, SendReceipt, SendRequest, Topic};
use convosync_proto::wire::{ClientFrame, Request, Response, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Backend, BackendError, RealtimeConnection};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type PendingMap = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Timeout for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the `Welcome` acknowledgment.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One open, greeted WebSocket.
struct WsLink {
    sender: Mutex<WsSender>,
    pending: PendingMap,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl WsLink {
    /// Opens a socket, sends `Hello` and waits for `Welcome`.
    ///
    /// Notifications received on the socket are forwarded to
    /// `notifications` when one is given and dropped otherwise.
    async fn open(
        url: &str,
        principal: &PrincipalId,
        notifications: Option<mpsc::Sender<Notification>>,
    ) -> Result<Self, BackendError> {
        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "backend WebSocket connect timed out");
                BackendError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "backend WebSocket connect failed");
                map_ws_connect_error(e)
            })?;
        let (mut sender, mut reader) = ws_stream.split();

        let hello = encode_frame(&ClientFrame::Hello {
            principal: principal.clone(),
        })?;
        sender.send(hello).await.map_err(|e| {
            tracing::warn!(err = %e, "failed to send Hello");
            BackendError::Disconnected
        })?;

        let greeting = tokio::time::timeout(HELLO_TIMEOUT, reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url, "backend Welcome timed out");
                BackendError::Timeout
            })?;
        match greeting {
            Some(Ok(Message::Binary(data))) => match codec::decode::<ServerFrame>(&data) {
                Ok(ServerFrame::Welcome { principal }) => {
                    tracing::info!(principal = %principal, url, "connected to backend");
                }
                Ok(ServerFrame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "backend refused connection");
                    return Err(BackendError::Rejected { code: 401, reason });
                }
                Ok(other) => {
                    tracing::warn!(?other, "unexpected frame during handshake");
                    return Err(BackendError::Protocol(
                        "unexpected frame during handshake".into(),
                    ));
                }
                Err(e) => {
                    return Err(BackendError::Protocol(format!(
                        "malformed handshake response: {e}"
                    )));
                }
            },
            Some(Ok(Message::Close(_))) | None => return Err(BackendError::Disconnected),
            Some(Ok(_)) => {
                return Err(BackendError::Protocol(
                    "unexpected non-binary frame during handshake".into(),
                ));
            }
            Some(Err(e)) => {
                tracing::warn!(err = %e, "WebSocket error during handshake");
                return Err(BackendError::Disconnected);
            }
        }

        let pending: PendingMap = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(
            reader,
            Arc::clone(&pending),
            notifications,
            Arc::clone(&connected),
        ));

        Ok(Self {
            sender: Mutex::new(sender),
            pending,
            next_id: AtomicU64::new(1),
            connected,
            reader_handle,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::Disconnected);
        }
        let message = encode_frame(frame)?;
        self.sender.lock().await.send(message).await.map_err(|e| {
            tracing::warn!(err = %e, "backend send failed");
            self.connected.store(false, Ordering::Relaxed);
            BackendError::Disconnected
        })
    }

    async fn request(&self, request: Request, timeout: Duration) -> Result<Response, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.send_frame(&ClientFrame::Request { id, request }).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // The reader dropped the pending sender: the socket closed.
            Ok(Err(_)) => Err(BackendError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&id);
                tracing::warn!(request_id = id, "backend request timed out");
                Err(BackendError::Timeout)
            }
        }
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// WebSocket implementation of [`Backend`].
pub struct WsBackend {
    url: String,
    principal: PrincipalId,
    request_timeout: Duration,
    notification_capacity: usize,
    link: Mutex<Option<Arc<WsLink>>>,
}

impl WsBackend {
    /// Creates a backend client. No connection is made until the first
    /// request or [`Backend::connect`].
    #[must_use]
    pub fn new(url: impl Into<String>, principal: PrincipalId) -> Self {
        Self {
            url: url.into(),
            principal,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            notification_capacity: 256,
            link: Mutex::new(None),
        }
    }

    /// Sets how long a request waits for its response.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the buffer size of each realtime connection.
    #[must_use]
    pub const fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// The backend URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request_link(&self) -> Result<Arc<WsLink>, BackendError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref()
            && link.is_connected()
        {
            return Ok(Arc::clone(link));
        }
        let link = Arc::new(WsLink::open(&self.url, &self.principal, None).await?);
        *guard = Some(Arc::clone(&link));
        Ok(link)
    }

    async fn request(&self, request: Request) -> Result<Response, BackendError> {
        let link = self.request_link().await?;
        match link.request(request, self.request_timeout).await? {
            Response::Rejected { code, reason } => Err(BackendError::Rejected { code, reason }),
            other => Ok(other),
        }
    }
}

impl Backend for WsBackend {
    type Connection = WsConnection;

    async fn connect(&self, principal: &PrincipalId) -> Result<WsConnection, BackendError> {
        let (tx, rx) = mpsc::channel(self.notification_capacity);
        let link = WsLink::open(&self.url, principal, Some(tx)).await?;
        Ok(WsConnection {
            link,
            notifications: rx,
        })
    }

    async fn send_message(&self, request: SendRequest) -> Result<SendReceipt, BackendError> {
        match self.request(Request::Send(request)).await? {
            Response::Sent(receipt) => Ok(receipt),
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_conversations(
        &self,
        principal: &PrincipalId,
    ) -> Result<Vec<Conversation>, BackendError> {
        match self
            .request(Request::FetchConversations(principal.clone()))
            .await?
        {
            Response::Conversations(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_messages(
        &self,
        conversation: &ConversationId,
        range: FetchRange,
    ) -> Result<Vec<ServerMessage>, BackendError> {
        let request = Request::FetchMessages {
            conversation: conversation.clone(),
            range,
        };
        match self.request(request).await? {
            Response::Messages(list) => Ok(list),
            other => Err(unexpected(&other)),
        }
    }
}

/// Realtime connection over its own WebSocket.
pub struct WsConnection {
    link: WsLink,
    notifications: mpsc::Receiver<Notification>,
}

impl RealtimeConnection for WsConnection {
    async fn subscribe(&mut self, topic: Topic) -> Result<(), BackendError> {
        self.link.send_frame(&ClientFrame::Subscribe(topic)).await
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), BackendError> {
        self.link
            .send_frame(&ClientFrame::Unsubscribe(topic.clone()))
            .await
    }

    async fn next_notification(&mut self) -> Result<Notification, BackendError> {
        self.notifications
            .recv()
            .await
            .ok_or(BackendError::Disconnected)
    }
}

/// Reads frames until the socket closes, completing pending requests and
/// forwarding notifications.
///
/// Malformed frames are logged and skipped. Dropping the pending senders
/// on exit fails every outstanding request with `Disconnected`.
async fn reader_loop(
    mut reader: WsReader,
    pending: PendingMap,
    notifications: Option<mpsc::Sender<Notification>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = reader.next().await {
        match msg_result {
            Ok(Message::Binary(data)) => match codec::decode::<ServerFrame>(&data) {
                Ok(ServerFrame::Response { id, response }) => {
                    let waiter = pending.lock().remove(&id);
                    match waiter {
                        Some(tx) => {
                            // The requester may have timed out already.
                            let _ = tx.send(response);
                        }
                        None => tracing::debug!(request_id = id, "response for unknown request"),
                    }
                }
                Ok(ServerFrame::Notification(notification)) => {
                    if let Some(tx) = &notifications
                        && tx.send(notification).await.is_err()
                    {
                        break;
                    }
                }
                Ok(ServerFrame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "backend error, closing");
                    break;
                }
                Ok(ServerFrame::Welcome { .. }) => {
                    tracing::debug!("duplicate Welcome ignored");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed backend frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("backend WebSocket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "backend WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    pending.lock().clear();
    tracing::debug!("backend reader task exiting");
}

fn encode_frame(frame: &ClientFrame) -> Result<Message, BackendError> {
    codec::encode(frame)
        .map(|bytes| Message::Binary(bytes.into()))
        .map_err(|e| BackendError::Protocol(e.to_string()))
}

fn unexpected(response: &Response) -> BackendError {
    tracing::warn!(?response, "unexpected response variant");
    BackendError::Protocol("unexpected response variant".into())
}

/// Map a `tokio_tungstenite` connection error to a [`BackendError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> BackendError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => BackendError::Unreachable(io_err.to_string()),
        WsError::Url(e) => BackendError::Unreachable(format!("invalid URL: {e}")),
        WsError::Http(response) => {
            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                BackendError::Unreachable(format!("HTTP upgrade refused: {status}"))
            } else {
                BackendError::Rejected {
                    code: status.as_u16(),
                    reason: "HTTP upgrade refused".into(),
                }
            }
        }
        other => BackendError::Unreachable(other.to_string()),
    }
}
