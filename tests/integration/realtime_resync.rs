// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for realtime sync against the in-process backend.
//!
//! Each test wires a `MemoryBackend`, a `StoreHandle` and a running
//! `RealtimeSync`, then drives the backend the way a server would:
//! dropped connections, lost and duplicated notifications, gaps in the
//! sequence, presence changes and removed conversations.
//!
//! Verification command: `cargo test --test realtime_resync`

use std::sync::Arc;
use std::time::Duration;

use convosync::backend::memory::MemoryBackend;
use convosync::crypto::MessageEnvelope;
use convosync::store::{
    Action, ConversationStore, DeliveryStatus, EncryptionTag, Message, MessageContent, StoreHandle,
};
use convosync::sync::{RealtimeSync, SyncConfig, SyncEvent, SyncHandle};
use convosync_proto::message::{ConversationId, PrincipalId, SequenceNumber, ServerId, Timestamp};
use convosync_proto::presence::PresenceStatus;

// =============================================================================
// Test helpers
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn alice() -> PrincipalId {
    PrincipalId::new("alice")
}

fn bob() -> PrincipalId {
    PrincipalId::new("bob")
}

fn general() -> ConversationId {
    ConversationId::new("general")
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(80),
        ..SyncConfig::default()
    }
}

struct Harness {
    backend: MemoryBackend,
    store: StoreHandle,
    sync: SyncHandle,
}

/// Starts a sync for alice with `general` open.
async fn harness() -> Harness {
    let backend = MemoryBackend::new();
    backend.create_conversation(general(), [alice(), bob()]);
    let (store, effects) = StoreHandle::new(alice());
    let sync = RealtimeSync::spawn(
        Arc::new(backend.clone()),
        store.clone(),
        effects,
        alice(),
        MessageEnvelope::disabled(),
        fast_config(),
    );
    sync.open(general()).await;
    let mut harness = Harness {
        backend,
        store,
        sync,
    };
    harness.wait_event(|e| matches!(e, SyncEvent::Resynced { .. })).await;
    harness
}

impl Harness {
    async fn wait_for(&self, mut pred: impl FnMut(&ConversationStore) -> bool) {
        let mut revision = self.store.subscribe();
        tokio::time::timeout(WAIT, async {
            loop {
                if self.store.read(&mut pred) {
                    return;
                }
                revision.changed().await.unwrap();
            }
        })
        .await
        .expect("store never reached the expected state");
    }

    async fn wait_event(&mut self, mut pred: impl FnMut(&SyncEvent) -> bool) -> SyncEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.sync.next_event().await.expect("sync task stopped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected sync event never arrived")
    }

    fn texts(&self) -> Vec<String> {
        self.store.read(|s| {
            s.messages(&general())
                .iter()
                .map(|m| m.content.as_text().unwrap_or_default().to_string())
                .collect()
        })
    }

    fn sequences(&self) -> Vec<u64> {
        self.store.read(|s| {
            s.messages(&general())
                .iter()
                .filter_map(|m| m.sequence.map(SequenceNumber::value))
                .collect()
        })
    }
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn live_messages_render_in_order() {
    let h = harness().await;
    for text in ["a", "b", "c"] {
        h.backend.post(&general(), &bob(), text).unwrap();
    }
    h.wait_for(|s| s.messages(&general()).len() == 3).await;
    assert_eq!(h.texts(), ["a", "b", "c"]);
    assert_eq!(h.store.read(|s| s.conversation(&general()).unwrap().unread_count), 3);

    h.store.dispatch(Action::MarkRead(general()));
    assert_eq!(h.store.read(ConversationStore::total_unread), 0);
    h.sync.shutdown().await;
}

#[tokio::test]
async fn duplicate_notifications_are_harmless() {
    let h = harness().await;
    for text in ["a", "b", "c"] {
        h.backend.post(&general(), &bob(), text).unwrap();
    }
    h.wait_for(|s| s.messages(&general()).len() == 3).await;

    h.backend.redeliver(&general());
    h.backend.post(&general(), &bob(), "d").unwrap();
    h.wait_for(|s| s.messages(&general()).len() >= 4).await;

    assert_eq!(h.sequences(), [1, 2, 3, 4]);
    assert_eq!(h.texts(), ["a", "b", "c", "d"]);
    h.sync.shutdown().await;
}

#[tokio::test]
async fn delivery_updates_advance_status() {
    let h = harness().await;
    let posted = h.backend.post(&general(), &bob(), "hello").unwrap();
    h.wait_for(|s| s.messages(&general()).len() == 1).await;

    h.backend.mark_delivered(&general(), posted.sequence);
    h.wait_for(|s| {
        s.messages(&general())
            .first()
            .is_some_and(|m| m.status == DeliveryStatus::Delivered)
    })
    .await;
    h.sync.shutdown().await;
}

// =============================================================================
// Gaps and resync
// =============================================================================

#[tokio::test]
async fn gap_is_backfilled_before_later_messages_render() {
    let h = harness().await;
    h.backend.post(&general(), &bob(), "one").unwrap();
    h.wait_for(|s| s.messages(&general()).len() == 1).await;

    // The notification for "two" is lost; "three" arrives past the gap.
    h.backend.post_silently(&general(), &bob(), "two").unwrap();
    h.backend.post(&general(), &bob(), "three").unwrap();

    h.wait_for(|s| s.messages(&general()).len() == 3).await;
    assert_eq!(h.texts(), ["one", "two", "three"]);
    assert_eq!(h.store.read(|s| s.held_count(&general())), 0);
    h.sync.shutdown().await;
}

#[tokio::test]
async fn failed_backfill_is_retried_until_the_gap_closes() {
    let h = harness().await;
    h.backend.post(&general(), &bob(), "one").unwrap();
    h.wait_for(|s| s.messages(&general()).len() == 1).await;

    // The first two attempts to fetch the missing "two" time out.
    h.backend.fail_next_fetches(2);
    h.backend.post_silently(&general(), &bob(), "two").unwrap();
    h.backend.post(&general(), &bob(), "three").unwrap();

    h.wait_for(|s| s.messages(&general()).len() == 3).await;
    assert_eq!(h.texts(), ["one", "two", "three"]);
    assert_eq!(h.store.read(|s| s.held_count(&general())), 0);
    h.sync.shutdown().await;
}

#[tokio::test]
async fn reconnect_resync_picks_up_missed_messages() {
    let mut h = harness().await;
    h.backend.post(&general(), &bob(), "before").unwrap();
    h.wait_for(|s| s.messages(&general()).len() == 1).await;

    h.backend.disconnect_all();
    h.backend.post_silently(&general(), &bob(), "while away").unwrap();

    let event = h
        .wait_event(|e| matches!(e, SyncEvent::Disconnected { .. }))
        .await;
    assert!(matches!(event, SyncEvent::Disconnected { attempt: 1, .. }));
    h.wait_event(|e| matches!(e, SyncEvent::Connected)).await;
    h.wait_event(|e| matches!(e, SyncEvent::Resynced { .. })).await;

    h.wait_for(|s| s.messages(&general()).len() == 2).await;
    assert_eq!(h.texts(), ["before", "while away"]);

    // Live delivery continues on the new connection.
    h.backend.post(&general(), &bob(), "after").unwrap();
    h.wait_for(|s| s.messages(&general()).len() == 3).await;
    h.sync.shutdown().await;
}

#[tokio::test]
async fn offline_backend_backs_off_then_recovers() {
    let mut h = harness().await;
    h.backend.set_offline(true);

    let mut attempts = Vec::new();
    while attempts.len() < 3 {
        if let SyncEvent::Disconnected { attempt, .. } = h
            .wait_event(|e| matches!(e, SyncEvent::Disconnected { .. }))
            .await
        {
            attempts.push(attempt);
        }
    }
    assert_eq!(attempts, [1, 2, 3]);

    h.backend.post_silently(&general(), &bob(), "queued").ok();
    h.backend.set_offline(false);
    h.wait_event(|e| matches!(e, SyncEvent::Connected)).await;
    h.wait_for(|s| s.messages(&general()).len() == 1).await;
    h.sync.shutdown().await;
}

// =============================================================================
// Conversations and presence
// =============================================================================

#[tokio::test]
async fn new_and_removed_conversations_follow_backend() {
    let h = harness().await;
    let side = ConversationId::new("side");
    h.backend.create_conversation(side.clone(), [alice(), bob()]);
    h.wait_for(|s| s.conversation(&side).is_some()).await;

    h.backend.post(&general(), &bob(), "hi").unwrap();
    h.wait_for(|s| s.messages(&general()).len() == 1).await;

    h.backend.remove_conversation(&general());
    h.wait_for(|s| s.is_removed(&general())).await;
    assert!(h.store.read(|s| s.messages(&general()).is_empty()));
    assert!(h.store.read(|s| s.conversation(&side).is_some()));
    h.sync.shutdown().await;
}

#[tokio::test]
async fn message_for_invisible_conversation_is_dropped() {
    let h = harness().await;
    let hidden = ConversationId::new("hidden");
    h.backend.create_conversation(hidden.clone(), [bob()]);

    h.store.dispatch(Action::UpsertMessage(Message {
        client_id: None,
        server_id: Some(ServerId::new("x1")),
        conversation_id: hidden.clone(),
        sender_id: bob(),
        content: MessageContent::Text("not for alice".into()),
        encryption: EncryptionTag::Unencrypted,
        sequence: Some(SequenceNumber::new(1)),
        status: DeliveryStatus::Sent,
        created_at: Timestamp::now(),
    }));

    h.wait_for(|s| s.is_removed(&hidden)).await;
    assert!(h.store.read(|s| s.conversation(&hidden).is_none()));
    h.sync.shutdown().await;
}

#[tokio::test]
async fn presence_changes_are_reported_once() {
    let mut h = harness().await;
    h.backend.set_presence(&bob(), PresenceStatus::Online);
    let event = h
        .wait_event(|e| matches!(e, SyncEvent::Presence { .. }))
        .await;
    assert_eq!(
        event,
        SyncEvent::Presence {
            principal: bob(),
            status: PresenceStatus::Online
        }
    );

    // Same status again is not reported; the next change is.
    h.backend.set_presence(&bob(), PresenceStatus::Online);
    h.backend.set_presence(&bob(), PresenceStatus::Away);
    let event = h
        .wait_event(|e| matches!(e, SyncEvent::Presence { .. }))
        .await;
    assert_eq!(
        event,
        SyncEvent::Presence {
            principal: bob(),
            status: PresenceStatus::Away
        }
    );
    assert_eq!(h.sync.presence().status(&bob()), Some(PresenceStatus::Away));
    h.sync.shutdown().await;
}

#[tokio::test]
async fn closed_conversation_stops_live_updates() {
    let h = harness().await;
    h.backend.post(&general(), &bob(), "seen").unwrap();
    h.wait_for(|s| s.messages(&general()).len() == 1).await;

    // Commands run in order: once "side" has loaded, "general" is closed.
    h.sync.close(general()).await;
    let side = ConversationId::new("side");
    h.backend.create_conversation(side.clone(), [alice(), bob()]);
    h.sync.open(side.clone()).await;
    h.backend.post(&side, &bob(), "first").unwrap();
    h.wait_for(|s| s.messages(&side).len() == 1).await;

    h.backend.post(&general(), &bob(), "unseen").unwrap();
    h.backend.post(&side, &bob(), "second").unwrap();
    h.wait_for(|s| s.messages(&side).len() == 2).await;

    assert_eq!(h.texts(), ["seen"]);
    h.sync.shutdown().await;
}
