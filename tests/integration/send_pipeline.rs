// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for the message send pipeline.
//!
//! Covers optimistic display, replacement by the backend receipt, failure
//! visibility, explicit retry with the original client id, and the race
//! between the realtime echo of our own message and its receipt.
//!
//! Verification command: `cargo test --test send_pipeline`

use std::sync::Arc;
use std::time::Duration;

use convosync::backend::memory::MemoryBackend;
use convosync::crypto::MessageEnvelope;
use convosync::send::{SendError, SendPipeline};
use convosync::store::{
    ConversationStore, DeliveryStatus, FailureReason, MessageContent, SendOutcome, StoreHandle,
};
use convosync::sync::{RealtimeSync, SyncConfig, SyncEvent, SyncHandle};
use convosync_proto::message::{ConversationId, PrincipalId, SequenceNumber};

// =============================================================================
// Test helpers
// =============================================================================

fn alice() -> PrincipalId {
    PrincipalId::new("alice")
}

fn general() -> ConversationId {
    ConversationId::new("general")
}

fn backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.create_conversation(general(), [alice(), PrincipalId::new("bob")]);
    backend
}

fn pipeline(backend: &MemoryBackend, store: &StoreHandle) -> SendPipeline<MemoryBackend> {
    SendPipeline::new(Arc::new(backend.clone()), store.clone(), alice(), false, None)
}

/// Waits until `pred` holds for the store, failing after five seconds.
async fn wait_for(store: &StoreHandle, mut pred: impl FnMut(&ConversationStore) -> bool) {
    let mut revision = store.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.read(&mut pred) {
                return;
            }
            revision.changed().await.unwrap();
        }
    })
    .await
    .expect("store never reached the expected state");
}

async fn wait_for_resync(sync: &mut SyncHandle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(SyncEvent::Resynced { .. }) = sync.next_event().await {
                return;
            }
        }
    })
    .await
    .expect("no resync");
}

// =============================================================================
// Optimistic replacement
// =============================================================================

#[tokio::test]
async fn receipt_replaces_optimistic_entry() {
    let backend = backend();
    let (store, _effects) = StoreHandle::new(alice());
    let sender = pipeline(&backend, &store).open_conversation(general());

    let ticket = sender.send("hello bob").unwrap();
    let client_id = ticket.client_id();
    let pending = store.read(|s| s.message_by_client_id(&client_id).cloned().unwrap());
    assert_eq!(pending.status, DeliveryStatus::Pending);
    assert_eq!(pending.server_id, None);

    let Some(SendOutcome::Sent(receipt)) = ticket.outcome().await else {
        panic!("send did not succeed");
    };

    let messages: Vec<_> = store.read(|s| s.messages(&general()).into_iter().cloned().collect());
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].client_id, Some(client_id));
    assert_eq!(messages[0].server_id, Some(receipt.server_id));
    assert_eq!(messages[0].sequence, Some(SequenceNumber::new(1)));
    assert_eq!(messages[0].status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn invalid_text_never_reaches_store_or_backend() {
    let backend = backend();
    let (store, _effects) = StoreHandle::new(alice());
    let sender = pipeline(&backend, &store).open_conversation(general());

    assert!(matches!(sender.send(""), Err(SendError::Validation(_))));
    let huge = "x".repeat(convosync_proto::message::MAX_MESSAGE_SIZE + 1);
    assert!(matches!(sender.send(&huge), Err(SendError::Validation(_))));
    assert!(store.read(|s| s.messages(&general()).is_empty()));
    assert_eq!(backend.send_attempts(), 0);
}

#[tokio::test]
async fn concurrent_sends_render_in_sequence_order() {
    let backend = backend();
    let (store, _effects) = StoreHandle::new(alice());
    let sender = pipeline(&backend, &store).open_conversation(general());

    let tickets: Vec<_> = (0..5)
        .map(|i| sender.send(&format!("message {i}")).unwrap())
        .collect();
    for ticket in tickets {
        assert!(matches!(ticket.outcome().await, Some(SendOutcome::Sent(_))));
    }

    let sequences: Vec<u64> = store.read(|s| {
        s.messages(&general())
            .iter()
            .map(|m| m.sequence.unwrap().value())
            .collect()
    });
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
}

// =============================================================================
// Failure and retry
// =============================================================================

#[tokio::test]
async fn permanent_rejection_then_manual_retry_yields_one_message() {
    let backend = backend();
    let (store, _effects) = StoreHandle::new(alice());
    let sender = pipeline(&backend, &store).open_conversation(general());

    backend.reject_next_send(451, "content policy");
    let ticket = sender.send("hi").unwrap();
    let client_id = ticket.client_id();
    let outcome = ticket.outcome().await.unwrap();
    assert_eq!(
        outcome,
        SendOutcome::Failed(FailureReason::Rejected {
            code: 451,
            reason: "content policy".into()
        })
    );

    // The failed entry stays visible with its text.
    let failed = store.read(|s| s.message_by_client_id(&client_id).cloned().unwrap());
    assert!(failed.status.is_failed());
    assert_eq!(failed.content, MessageContent::Text("hi".into()));

    let retry = sender.retry(client_id).unwrap();
    assert_eq!(retry.client_id(), client_id);
    assert!(matches!(retry.outcome().await, Some(SendOutcome::Sent(_))));

    assert_eq!(backend.messages(&general()).len(), 1);
    let messages: Vec<_> = store.read(|s| s.messages(&general()).into_iter().cloned().collect());
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn transient_failure_is_reported_as_network() {
    let backend = backend();
    let (store, _effects) = StoreHandle::new(alice());
    let sender = pipeline(&backend, &store).open_conversation(general());

    backend.fail_next_sends(1);
    let ticket = sender.send("are you there").unwrap();
    let client_id = ticket.client_id();
    assert!(matches!(
        ticket.outcome().await,
        Some(SendOutcome::Failed(FailureReason::Network(_)))
    ));

    let retry = sender.retry(client_id).unwrap();
    assert!(matches!(retry.outcome().await, Some(SendOutcome::Sent(_))));
    assert_eq!(backend.send_attempts(), 2);
}

#[tokio::test]
async fn lost_receipt_retry_is_deduplicated_by_backend() {
    let backend = backend();
    let (store, _effects) = StoreHandle::new(alice());
    let sender = pipeline(&backend, &store).open_conversation(general());

    backend.lose_next_receipt();
    let ticket = sender.send("only once").unwrap();
    let client_id = ticket.client_id();
    assert!(matches!(
        ticket.outcome().await,
        Some(SendOutcome::Failed(FailureReason::Network(_)))
    ));
    // The backend already stored it.
    assert_eq!(backend.messages(&general()).len(), 1);

    let retry = sender.retry(client_id).unwrap();
    let Some(SendOutcome::Sent(receipt)) = retry.outcome().await else {
        panic!("retry did not succeed");
    };
    assert_eq!(receipt.sequence, SequenceNumber::new(1));
    assert_eq!(backend.messages(&general()).len(), 1);
    assert_eq!(store.read(|s| s.messages(&general()).len()), 1);
}

#[tokio::test]
async fn only_failed_messages_can_be_retried() {
    let backend = backend();
    let (store, _effects) = StoreHandle::new(alice());
    let sender = pipeline(&backend, &store).open_conversation(general());

    let ticket = sender.send("fine").unwrap();
    let client_id = ticket.client_id();
    ticket.outcome().await.unwrap();
    assert!(matches!(
        sender.retry(client_id),
        Err(SendError::NotRetryable(_))
    ));

    let other = pipeline(&backend, &store).open_conversation(ConversationId::new("elsewhere"));
    assert!(matches!(
        other.retry(client_id),
        Err(SendError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn dropped_ticket_outcome_still_recorded() {
    let backend = backend();
    let (store, _effects) = StoreHandle::new(alice());
    let sender = pipeline(&backend, &store).open_conversation(general());

    backend.reject_next_send(403, "muted");
    let client_id = sender.send("view closed").unwrap().client_id();
    wait_for(&store, |s| {
        s.message_by_client_id(&client_id)
            .is_some_and(|m| m.status.is_failed())
    })
    .await;
}

// =============================================================================
// Interaction with realtime sync
// =============================================================================

#[tokio::test]
async fn realtime_echo_and_receipt_collapse_into_one_message() {
    let backend = backend();
    let (store, effects) = StoreHandle::new(alice());
    let mut sync = RealtimeSync::spawn(
        Arc::new(backend.clone()),
        store.clone(),
        effects,
        alice(),
        MessageEnvelope::disabled(),
        SyncConfig::default(),
    );
    sync.open(general()).await;
    wait_for_resync(&mut sync).await;

    let sender = pipeline(&backend, &store).open_conversation(general());
    let mut client_ids = Vec::new();
    for text in ["one", "two", "three"] {
        let ticket = sender.send(text).unwrap();
        client_ids.push(ticket.client_id());
        assert!(matches!(ticket.outcome().await, Some(SendOutcome::Sent(_))));
    }

    // Let the realtime echoes land too.
    backend.post(&general(), &PrincipalId::new("bob"), "reply").unwrap();
    wait_for(&store, |s| s.messages(&general()).len() >= 4).await;

    let messages: Vec<_> = store.read(|s| s.messages(&general()).into_iter().cloned().collect());
    assert_eq!(messages.len(), 4);
    for (message, client_id) in messages.iter().zip(&client_ids) {
        assert_eq!(message.client_id, Some(*client_id));
    }
    assert_eq!(messages[3].sender_id, PrincipalId::new("bob"));

    sync.shutdown().await;
}
