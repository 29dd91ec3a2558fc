//! Reconnecting stream of realtime notifications.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use convosync_proto::message::PrincipalId;
use convosync_proto::notification::{Notification, Topic};
use futures_util::Stream;
use tokio::time::Instant;

use super::backoff::Backoff;
use crate::backend::{Backend, BackendError, RealtimeConnection};

/// One item of a [`ChangeFeed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    /// A change from the backend.
    Notification(Notification),
    /// A connection was (re)established and every topic re-subscribed.
    /// Anything may have changed while disconnected.
    Reconnected,
    /// The connection is down; the next attempt happens after `retry_in`.
    Disconnected {
        /// Consecutive failed attempts, starting at 1.
        attempt: u32,
        /// Delay before the next attempt.
        retry_in: Duration,
    },
}

/// Lazy, infinite sequence of [`FeedItem`]s for one principal.
///
/// Nothing happens until the first [`ChangeFeed::next`]. The feed keeps the
/// principal's conversation-list topic plus every added topic subscribed
/// across reconnects. [`ChangeFeed::next`] is cancel-safe.
pub struct ChangeFeed<B: Backend> {
    backend: Arc<B>,
    principal: PrincipalId,
    topics: BTreeSet<Topic>,
    connection: Option<B::Connection>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl<B: Backend> ChangeFeed<B> {
    /// Creates a feed. No connection is made yet.
    #[must_use]
    pub fn new(backend: Arc<B>, principal: PrincipalId, backoff: Backoff) -> Self {
        let topics = BTreeSet::from([Topic::Principal(principal.clone())]);
        Self {
            backend,
            principal,
            topics,
            connection: None,
            backoff,
            retry_at: None,
        }
    }

    /// Returns `true` while a connection is up.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Topics that are (re)subscribed on every connection.
    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter()
    }

    /// Adds a topic. It is subscribed now if connected, otherwise on the
    /// next connection.
    pub async fn subscribe(&mut self, topic: Topic) {
        if !self.topics.insert(topic.clone()) {
            return;
        }
        if let Some(conn) = self.connection.as_mut()
            && let Err(e) = conn.subscribe(topic.clone()).await
        {
            tracing::warn!(%topic, error = %e, "subscribe failed, reconnecting");
            self.connection = None;
        }
    }

    /// Removes a topic. The principal's own topic cannot be removed.
    pub async fn unsubscribe(&mut self, topic: &Topic) {
        if *topic == Topic::Principal(self.principal.clone()) || !self.topics.remove(topic) {
            return;
        }
        if let Some(conn) = self.connection.as_mut()
            && let Err(e) = conn.unsubscribe(topic).await
        {
            tracing::debug!(%topic, error = %e, "unsubscribe failed, reconnecting");
            self.connection = None;
        }
    }

    /// Waits for the next item.
    pub async fn next(&mut self) -> FeedItem {
        if let Some(at) = self.retry_at {
            tokio::time::sleep_until(at).await;
            self.retry_at = None;
        }

        let Some(conn) = self.connection.as_mut() else {
            return match establish(&*self.backend, &self.principal, &self.topics).await {
                Ok(conn) => {
                    self.connection = Some(conn);
                    self.backoff.reset();
                    tracing::info!(
                        principal = %self.principal,
                        topics = self.topics.len(),
                        "realtime connection established"
                    );
                    FeedItem::Reconnected
                }
                Err(e) => self.schedule_retry(&e),
            };
        };

        match conn.next_notification().await {
            Ok(notification) => FeedItem::Notification(notification),
            Err(e) => {
                self.connection = None;
                self.schedule_retry(&e)
            }
        }
    }

    /// Converts the feed into a [`Stream`] that never ends.
    pub fn into_stream(self) -> impl Stream<Item = FeedItem> + Send {
        futures_util::stream::unfold(self, |mut feed| async move {
            let item = feed.next().await;
            Some((item, feed))
        })
    }

    fn schedule_retry(&mut self, error: &BackendError) -> FeedItem {
        let retry_in = self.backoff.next_delay();
        let attempt = self.backoff.attempt();
        self.retry_at = Some(Instant::now() + retry_in);
        tracing::warn!(
            principal = %self.principal,
            attempt,
            retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "realtime connection lost"
        );
        FeedItem::Disconnected { attempt, retry_in }
    }
}

async fn establish<B: Backend>(
    backend: &B,
    principal: &PrincipalId,
    topics: &BTreeSet<Topic>,
) -> Result<B::Connection, BackendError> {
    let mut conn = backend.connect(principal).await?;
    for topic in topics {
        conn.subscribe(topic.clone()).await?;
    }
    Ok(conn)
}

impl<B: Backend> std::fmt::Debug for ChangeFeed<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("principal", &self.principal)
            .field("topics", &self.topics)
            .field("connected", &self.connection.is_some())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
