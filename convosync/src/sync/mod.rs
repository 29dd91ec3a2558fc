//! Realtime synchronization between the backend and the conversation
//! store.
//!
//! [`RealtimeSync`] drives a [`ChangeFeed`], turns notifications into
//! store actions, resynchronizes after every reconnect and services the
//! effects the store asks for (backfills, unknown conversations).

pub mod backoff;
pub mod feed;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use convosync_proto::message::{ConversationId, PrincipalId, SequenceNumber};
use convosync_proto::notification::{FetchRange, Notification, Topic};
use convosync_proto::presence::{PresenceStatus, PresenceUpdate};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use backoff::Backoff;
pub use feed::{ChangeFeed, FeedItem};

use crate::backend::{Backend, BackendError};
use crate::crypto::MessageEnvelope;
use crate::store::{Action, EffectReceiver, StoreEffect, StoreHandle};

/// Requests to the sync task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// Subscribe to a conversation's messages and load them.
    Open(ConversationId),
    /// Stop following a conversation.
    Close(ConversationId),
    /// Stop the sync task.
    Shutdown,
}

/// What the sync task reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The realtime connection is up.
    Connected,
    /// The realtime connection is down.
    Disconnected {
        /// Consecutive failed attempts.
        attempt: u32,
        /// Delay before the next attempt.
        retry_in: Duration,
    },
    /// A full resync finished.
    Resynced {
        /// Number of conversations loaded.
        conversations: usize,
    },
    /// A principal's presence changed.
    Presence {
        /// Whose presence.
        principal: PrincipalId,
        /// The new status.
        status: PresenceStatus,
    },
}

/// Latest known presence of every principal seen so far.
#[derive(Debug, Clone, Default)]
pub struct PresenceBoard {
    inner: Arc<RwLock<HashMap<PrincipalId, PresenceUpdate>>>,
}

impl PresenceBoard {
    /// Status of `principal`, if known.
    #[must_use]
    pub fn status(&self, principal: &PrincipalId) -> Option<PresenceStatus> {
        self.inner.read().get(principal).map(|u| u.status)
    }

    /// Every known presence.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<PrincipalId, PresenceStatus> {
        self.inner
            .read()
            .iter()
            .map(|(p, u)| (p.clone(), u.status))
            .collect()
    }

    /// Records `update` unless a newer one is already known. Returns
    /// `true` if the status changed.
    fn record(&self, update: PresenceUpdate) -> bool {
        let mut map = self.inner.write();
        match map.get(&update.principal) {
            Some(current) if current.at > update.at => false,
            Some(current) if current.status == update.status => {
                map.insert(update.principal.clone(), update);
                false
            }
            _ => {
                map.insert(update.principal.clone(), update);
                true
            }
        }
    }
}

/// Tuning for the sync task.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// First reconnect delay.
    pub reconnect_base_delay: Duration,
    /// Largest reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Capacity of the command and event channels.
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

/// Handle to a running [`RealtimeSync`] task.
#[derive(Debug)]
pub struct SyncHandle {
    commands: mpsc::Sender<SyncCommand>,
    events: mpsc::Receiver<SyncEvent>,
    presence: PresenceBoard,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Starts following `conversation`.
    pub async fn open(&self, conversation: ConversationId) {
        self.command(SyncCommand::Open(conversation)).await;
    }

    /// Stops following `conversation`.
    pub async fn close(&self, conversation: ConversationId) {
        self.command(SyncCommand::Close(conversation)).await;
    }

    async fn command(&self, command: SyncCommand) {
        if self.commands.send(command).await.is_err() {
            tracing::debug!("sync task already stopped");
        }
    }

    /// Waits for the next event. Returns `None` once the task has stopped.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Presence of the principals seen so far.
    #[must_use]
    pub const fn presence(&self) -> &PresenceBoard {
        &self.presence
    }

    /// Stops the task and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(SyncCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "sync task ended abnormally");
        }
    }
}

enum Step {
    Feed(FeedItem),
    Command(Option<SyncCommand>),
    Effect(StoreEffect),
    RetryBackfills,
}

/// Everything the sync task shares while awaiting backend calls.
struct Context<B: Backend> {
    backend: Arc<B>,
    store: StoreHandle,
    principal: PrincipalId,
    envelope: MessageEnvelope,
    presence: PresenceBoard,
    events: mpsc::Sender<SyncEvent>,
}

/// Keeps a [`StoreHandle`] in step with the backend.
pub struct RealtimeSync<B: Backend> {
    ctx: Context<B>,
    effects: EffectReceiver,
    feed: ChangeFeed<B>,
    active: BTreeSet<ConversationId>,
    // Conversations whose last backfill failed, retried on a backoff.
    failed_backfills: BTreeSet<ConversationId>,
    backfill_backoff: Backoff,
    retry_at: Option<Instant>,
}

impl<B: Backend> RealtimeSync<B> {
    /// Spawns the sync task. Incoming bodies are opened with `envelope`.
    #[must_use]
    pub fn spawn(
        backend: Arc<B>,
        store: StoreHandle,
        effects: EffectReceiver,
        principal: PrincipalId,
        envelope: MessageEnvelope,
        config: SyncConfig,
    ) -> SyncHandle {
        let capacity = config.channel_capacity.max(1);
        let (commands, command_rx) = mpsc::channel(capacity);
        let (events_tx, events) = mpsc::channel(capacity);
        let presence = PresenceBoard::default();
        let feed = ChangeFeed::new(
            Arc::clone(&backend),
            principal.clone(),
            Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay),
        );
        let sync = Self {
            ctx: Context {
                backend,
                store,
                principal,
                envelope,
                presence: presence.clone(),
                events: events_tx,
            },
            effects,
            feed,
            active: BTreeSet::new(),
            failed_backfills: BTreeSet::new(),
            backfill_backoff: Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay),
            retry_at: None,
        };
        let task = tokio::spawn(sync.run(command_rx));
        SyncHandle {
            commands,
            events,
            presence,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SyncCommand>) {
        tracing::info!(principal = %self.ctx.principal, "realtime sync started");
        loop {
            let step = tokio::select! {
                item = self.feed.next() => Step::Feed(item),
                command = commands.recv() => Step::Command(command),
                Some(effect) = self.effects.recv() => Step::Effect(effect),
                () = sleep_until(self.retry_at) => Step::RetryBackfills,
            };
            match step {
                Step::Feed(FeedItem::Notification(notification)) => self.ctx.apply(notification),
                Step::Feed(FeedItem::Reconnected) => {
                    self.ctx.emit(SyncEvent::Connected);
                    match self.ctx.resync(&self.active).await {
                        Ok(conversations) => {
                            self.ctx.emit(SyncEvent::Resynced { conversations });
                            self.retry_backfills();
                        }
                        Err(e) => tracing::warn!(error = %e, "resync failed"),
                    }
                }
                Step::Feed(FeedItem::Disconnected { attempt, retry_in }) => {
                    self.ctx.emit(SyncEvent::Disconnected { attempt, retry_in });
                }
                Step::Command(Some(SyncCommand::Open(id))) => {
                    tracing::debug!(conversation = %id, "conversation opened");
                    self.active.insert(id.clone());
                    self.feed.subscribe(Topic::Conversation(id.clone())).await;
                    if let Err(e) = self.ctx.load_messages(&id, FetchRange::all()).await {
                        tracing::warn!(conversation = %id, error = %e, "initial message load failed");
                    }
                }
                Step::Command(Some(SyncCommand::Close(id))) => {
                    self.feed.unsubscribe(&Topic::Conversation(id.clone())).await;
                    self.active.remove(&id);
                    tracing::debug!(conversation = %id, "conversation closed");
                }
                Step::Command(Some(SyncCommand::Shutdown) | None) => break,
                Step::Effect(effect) => match self.ctx.service(effect).await {
                    Some(conversation) => self.schedule_backfill_retry(conversation),
                    None if self.failed_backfills.is_empty() => self.backfill_backoff.reset(),
                    None => {}
                },
                Step::RetryBackfills => self.retry_backfills(),
            }
        }
        tracing::info!(principal = %self.ctx.principal, "realtime sync stopped");
    }

    fn schedule_backfill_retry(&mut self, conversation: ConversationId) {
        self.failed_backfills.insert(conversation);
        if self.retry_at.is_none() {
            let delay = self.backfill_backoff.next_delay();
            tracing::debug!(
                attempt = self.backfill_backoff.attempt(),
                ?delay,
                "backfill retry scheduled"
            );
            self.retry_at = Some(Instant::now() + delay);
        }
    }

    /// Asks the store to re-report the open gap of every conversation
    /// whose backfill failed.
    fn retry_backfills(&mut self) {
        self.retry_at = None;
        for conversation in std::mem::take(&mut self.failed_backfills) {
            self.ctx.store.dispatch(Action::RetryBackfill(conversation));
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<B: Backend> std::fmt::Debug for RealtimeSync<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSync")
            .field("principal", &self.ctx.principal)
            .field("feed", &self.feed)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Context<B> {
    fn apply(&self, notification: Notification) {
        match notification {
            Notification::Message { message, .. } => {
                let message = self.envelope.open_message(message);
                self.store.dispatch(Action::UpsertMessage(message));
            }
            Notification::Conversation(conversation) => {
                self.store
                    .dispatch(Action::LoadConversations(vec![conversation]));
            }
            Notification::ConversationRemoved(id) => {
                self.store.dispatch(Action::RemoveConversation(id));
            }
            Notification::Presence(update) => {
                let principal = update.principal.clone();
                let status = update.status;
                if self.presence.record(update) {
                    self.emit(SyncEvent::Presence { principal, status });
                }
            }
        }
    }

    /// Reloads the conversation list and every active conversation.
    async fn resync(&self, active: &BTreeSet<ConversationId>) -> Result<usize, BackendError> {
        let conversations = self.backend.fetch_conversations(&self.principal).await?;
        let count = conversations.len();
        self.store
            .dispatch(Action::LoadConversations(conversations));
        for id in active {
            self.load_messages(id, FetchRange::all()).await?;
        }
        tracing::info!(conversations = count, active = active.len(), "resync complete");
        Ok(count)
    }

    /// Fetches `range` of `id` into the store. Returns the number of
    /// messages fetched.
    async fn load_messages(
        &self,
        id: &ConversationId,
        range: FetchRange,
    ) -> Result<usize, BackendError> {
        let messages = self.backend.fetch_messages(id, range).await?;
        let count = messages.len();
        for message in messages {
            let message = self.envelope.open_message(message);
            self.store.dispatch(Action::UpsertMessage(message));
        }
        Ok(count)
    }

    /// Carries out `effect`. Returns the conversation whose backfill
    /// failed, if any.
    async fn service(&self, effect: StoreEffect) -> Option<ConversationId> {
        match effect {
            StoreEffect::RequestBackfill {
                conversation,
                after,
                before,
            } => self.backfill(conversation, after, before).await,
            StoreEffect::ResyncConversation(id) => {
                if let Err(e) = self.resync_conversation(&id).await {
                    tracing::warn!(conversation = %id, error = %e, "conversation resync failed");
                }
                None
            }
        }
    }

    async fn backfill(
        &self,
        conversation: ConversationId,
        after: SequenceNumber,
        before: SequenceNumber,
    ) -> Option<ConversationId> {
        tracing::debug!(%conversation, %after, %before, "backfilling gap");
        match self
            .load_messages(&conversation, FetchRange::between(after, before))
            .await
        {
            // The backend has nothing in the gap: those numbers are gone.
            Ok(0) => {
                tracing::info!(%conversation, %after, %before, "gap is permanent, releasing held messages");
                self.store.dispatch(Action::ReleaseHeld {
                    conversation_id: conversation,
                    before: before.next(),
                });
                None
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(%conversation, error = %e, "backfill failed");
                Some(conversation)
            }
        }
    }

    async fn resync_conversation(&self, id: &ConversationId) -> Result<(), BackendError> {
        let conversations = self.backend.fetch_conversations(&self.principal).await?;
        let Some(conversation) = conversations.into_iter().find(|c| c.id == *id) else {
            tracing::info!(conversation = %id, "conversation no longer exists");
            self.store.dispatch(Action::RemoveConversation(id.clone()));
            return Ok(());
        };
        self.store
            .dispatch(Action::LoadConversations(vec![conversation]));
        self.load_messages(id, FetchRange::all()).await?;
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!(error = %e, "sync event dropped");
        }
    }
}
