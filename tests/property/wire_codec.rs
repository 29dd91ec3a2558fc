// Test-specific lint overrides: property tests use expect freely,
// and some pedantic lints are not appropriate for test code.
#![allow(clippy::expect_used, clippy::cast_possible_truncation, clippy::doc_markdown)]

//! Property-based tests for the realtime wire codec.
//!
//! Uses proptest to verify:
//! 1. Arbitrary bytes from a misbehaving backend never panic the decoder.
//! 2. Server frames carrying arbitrary message pages survive encode →
//!    decode, sealed bodies included.
//! 3. Truncated frames are rejected rather than partially decoded.

use proptest::prelude::*;

use convosync_proto::codec;
use convosync_proto::message::{
    ClientId, ConversationId, MessageBody, PrincipalId, SealedEnvelope, SequenceNumber, ServerId,
    ServerMessage, Timestamp,
};
use convosync_proto::wire::{ClientFrame, Response, ServerFrame};
use uuid::Uuid;

fn arb_body() -> impl Strategy<Value = MessageBody> {
    prop_oneof![
        "[^\x00]{0,256}".prop_map(MessageBody::Plain),
        (
            any::<u8>(),
            prop::collection::vec(any::<u8>(), 12),
            prop::collection::vec(any::<u8>(), 16..128),
        )
            .prop_map(|(version, nonce, ciphertext)| {
                MessageBody::Sealed(SealedEnvelope {
                    version,
                    nonce,
                    ciphertext,
                })
            }),
    ]
}

fn arb_server_message() -> impl Strategy<Value = ServerMessage> {
    (
        "[a-z0-9]{1,12}",
        prop::option::of(any::<u128>()),
        "[a-z-]{1,16}",
        "[a-z]{1,8}",
        arb_body(),
        1u64..1_000_000,
        any::<u64>(),
        any::<bool>(),
    )
        .prop_map(
            |(server_id, client_id, conversation, sender, body, sequence, created, delivered)| {
                ServerMessage {
                    server_id: ServerId::new(server_id),
                    client_id: client_id.map(|n| ClientId::from_uuid(Uuid::from_u128(n))),
                    conversation_id: ConversationId::new(conversation),
                    sender_id: PrincipalId::new(sender),
                    body,
                    sequence: SequenceNumber::new(sequence),
                    created_at: Timestamp::from_millis(created),
                    delivered,
                }
            },
        )
}

proptest! {
    /// Random bytes never panic the decoder; they decode or return Err.
    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode::<ServerFrame>(&bytes);
        let _ = codec::decode::<ClientFrame>(&bytes);
    }

    /// A message page survives encoding unchanged.
    #[test]
    fn message_page_survives_encoding(
        id in any::<u64>(),
        page in prop::collection::vec(arb_server_message(), 0..8),
    ) {
        let frame = ServerFrame::Response { id, response: Response::Messages(page) };
        let bytes = codec::encode(&frame).expect("encode should succeed");
        let decoded = codec::decode::<ServerFrame>(&bytes).expect("decode should succeed");
        prop_assert_eq!(decoded, frame);
    }

    /// Cutting a frame anywhere short of its end is an error.
    #[test]
    fn truncated_frame_is_rejected(message in arb_server_message(), cut in any::<prop::sample::Index>()) {
        let frame = ServerFrame::Response { id: 1, response: Response::Messages(vec![message]) };
        let bytes = codec::encode(&frame).expect("encode should succeed");
        let at = cut.index(bytes.len());
        prop_assert!(codec::decode::<ServerFrame>(&bytes[..at]).is_err());
    }
}
