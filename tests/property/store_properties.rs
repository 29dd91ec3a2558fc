// Test-specific lint overrides: property tests use expect freely,
// and some pedantic lints are not appropriate for test code.
#![allow(clippy::expect_used, clippy::cast_possible_truncation, clippy::doc_markdown)]

//! Property-based tests for the conversation store reducer.
//!
//! Uses proptest to verify:
//! 1. Applying the same message twice leaves the store as applying it once.
//! 2. Messages arriving in any order, with duplicates, render sorted by
//!    sequence with none dropped and none held back.
//! 3. Our own message collapses into one entry whichever of the send
//!    receipt and the realtime echo lands first.
//! 4. The unread counter matches the rendered messages from other people.

use proptest::prelude::*;

use convosync::store::{
    Action, ConversationStore, DeliveryStatus, Draft, EncryptionTag, Message, MessageContent,
    SendOutcome,
};
use convosync_proto::conversation::Conversation;
use convosync_proto::message::{
    ClientId, ConversationId, PrincipalId, SequenceNumber, ServerId, Timestamp,
};
use convosync_proto::notification::SendReceipt;

fn viewer() -> PrincipalId {
    PrincipalId::new("alice")
}

fn room() -> ConversationId {
    ConversationId::new("room")
}

fn loaded_store() -> ConversationStore {
    let mut store = ConversationStore::new(viewer());
    store.apply(Action::LoadConversations(vec![Conversation::new(
        room(),
        [viewer(), PrincipalId::new("bob")],
        Timestamp::from_millis(0),
    )]));
    store
}

fn server_message(seq: u64, from_viewer: bool) -> Message {
    Message {
        client_id: None,
        server_id: Some(ServerId::new(format!("m{seq}"))),
        conversation_id: room(),
        sender_id: if from_viewer {
            viewer()
        } else {
            PrincipalId::new("bob")
        },
        content: MessageContent::Text(format!("message {seq}")),
        encryption: EncryptionTag::Unencrypted,
        sequence: Some(SequenceNumber::new(seq)),
        status: DeliveryStatus::Sent,
        created_at: Timestamp::from_millis(1_000 + seq),
    }
}

/// Sequence numbers `1..=n` shuffled, with some of them repeated.
fn arrivals() -> impl Strategy<Value = (u64, Vec<u64>)> {
    (1u64..30)
        .prop_flat_map(|n| {
            let all: Vec<u64> = (1..=n).collect();
            (
                Just(n),
                Just(all.clone()).prop_shuffle(),
                prop::collection::vec(prop::sample::select(all), 0..10),
            )
        })
        .prop_map(|(n, mut order, repeats)| {
            order.extend(repeats);
            (n, order)
        })
        .prop_flat_map(|(n, order)| (Just(n), Just(order).prop_shuffle()))
}

proptest! {
    /// Upserting the same server message twice is the same as once.
    #[test]
    fn upsert_is_idempotent(prefix in 0u64..10, seq in 1u64..20, from_viewer in any::<bool>()) {
        let mut store = loaded_store();
        for s in 1..=prefix {
            store.apply(Action::UpsertMessage(server_message(s, false)));
        }
        let (once, _) = store.reduce(Action::UpsertMessage(server_message(seq, from_viewer)));
        let (twice, effects) = once
            .clone()
            .reduce(Action::UpsertMessage(server_message(seq, from_viewer)));
        prop_assert_eq!(&once, &twice);
        prop_assert!(effects.is_empty());
    }

    /// Any arrival order renders every message exactly once, sorted.
    #[test]
    fn any_arrival_order_renders_sorted((n, order) in arrivals()) {
        let mut store = loaded_store();
        for seq in order {
            store.apply(Action::UpsertMessage(server_message(seq, false)));
        }
        let rendered: Vec<u64> = store
            .messages(&room())
            .iter()
            .map(|m| m.sequence.expect("rendered messages are sequenced").value())
            .collect();
        let expected: Vec<u64> = (1..=n).collect();
        prop_assert_eq!(rendered, expected);
        prop_assert_eq!(store.held_count(&room()), 0);
        prop_assert_eq!(store.last_sequence(&room()), Some(SequenceNumber::new(n)));
    }

    /// Receipt and echo of our own send collapse into one entry.
    #[test]
    fn own_message_collapses_in_either_order(
        earlier in 0u64..5,
        echo_first in any::<bool>(),
        echo_has_client_id in any::<bool>(),
    ) {
        let mut store = loaded_store();
        for s in 1..=earlier {
            store.apply(Action::UpsertMessage(server_message(s, false)));
        }
        let client_id = ClientId::new();
        store.apply(Action::MarkSendPending {
            client_id,
            draft: Draft {
                conversation_id: room(),
                sender_id: viewer(),
                text: "mine".into(),
                encryption: EncryptionTag::Unencrypted,
                created_at: Timestamp::from_millis(5_000),
            },
        });

        let seq = earlier + 1;
        let mut echo = server_message(seq, true);
        echo.content = MessageContent::Text("mine".into());
        if echo_has_client_id {
            echo.client_id = Some(client_id);
        }
        let receipt = Action::MarkSendResult {
            client_id,
            outcome: SendOutcome::Sent(SendReceipt {
                server_id: echo.server_id.clone().expect("server message has an id"),
                sequence: SequenceNumber::new(seq),
                created_at: echo.created_at,
            }),
        };
        let echo = Action::UpsertMessage(echo);
        let steps = if echo_first { [echo, receipt] } else { [receipt, echo] };
        for step in steps {
            store.apply(step);
        }

        let messages = store.messages(&room());
        prop_assert_eq!(messages.len(), usize::try_from(seq).expect("small"));
        let own: Vec<&&Message> = messages
            .iter()
            .filter(|m| m.content == MessageContent::Text("mine".into()))
            .collect();
        prop_assert_eq!(own.len(), 1);
        prop_assert_eq!(own[0].sequence, Some(SequenceNumber::new(seq)));
        prop_assert!(own[0].status.is_confirmed());
        prop_assert!(store.message_by_client_id(&client_id).is_some());
    }

    /// Unread counts only other people's rendered messages and resets on read.
    #[test]
    fn unread_counts_messages_from_others(senders in prop::collection::vec(any::<bool>(), 1..25)) {
        let mut store = loaded_store();
        for (i, from_viewer) in senders.iter().enumerate() {
            let seq = u64::try_from(i).expect("small") + 1;
            store.apply(Action::UpsertMessage(server_message(seq, *from_viewer)));
        }
        let expected = senders.iter().filter(|from_viewer| !**from_viewer).count();
        let unread = store.conversation(&room()).expect("loaded").unread_count;
        prop_assert_eq!(unread as usize, expected);
        prop_assert_eq!(store.total_unread() as usize, expected);

        store.apply(Action::MarkRead(room()));
        prop_assert_eq!(store.total_unread(), 0);
    }
}
