// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for encrypted conversations.
//!
//! Alice sends through the pipeline with encryption on. Bob shares her
//! key, Carol holds a different key and Dave runs with encryption off.
//! The backend only ever stores sealed bytes; each reader sees either the
//! text or an explicit unavailable placeholder, never a crash or garbage.
//!
//! Verification command: `cargo test --test encrypted_conversation`

use std::sync::Arc;
use std::time::Duration;

use convosync::backend::Backend;
use convosync::backend::memory::MemoryBackend;
use convosync::crypto::envelope::MessageEnvelope;
use convosync::crypto::{ChaChaCipher, Cipher};
use convosync::send::SendPipeline;
use convosync::store::{
    ConversationStore, EncryptionTag, MessageContent, SendOutcome, StoreHandle, UnavailableReason,
};
use convosync::sync::{RealtimeSync, SyncConfig, SyncEvent, SyncHandle};
use convosync_proto::message::{
    ClientId, ConversationId, MessageBody, PrincipalId, SealedEnvelope,
};
use convosync_proto::notification::SendRequest;

// =============================================================================
// Test helpers
// =============================================================================

const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
const OTHER_KEY_HEX: &str = "ff0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

fn secret_room() -> ConversationId {
    ConversationId::new("secret-room")
}

fn cipher(hex_key: &str) -> Arc<dyn Cipher> {
    Arc::new(ChaChaCipher::from_hex(hex_key).unwrap())
}

fn backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.create_conversation(
        secret_room(),
        ["alice", "bob", "carol", "dave"].map(PrincipalId::new),
    );
    backend
}

/// One participant following `secret-room`.
struct Reader {
    store: StoreHandle,
    sync: SyncHandle,
}

impl Reader {
    async fn start(backend: &MemoryBackend, name: &str, envelope: MessageEnvelope) -> Self {
        let (store, effects) = StoreHandle::new(PrincipalId::new(name));
        let mut sync = RealtimeSync::spawn(
            Arc::new(backend.clone()),
            store.clone(),
            effects,
            PrincipalId::new(name),
            envelope,
            SyncConfig::default(),
        );
        sync.open(secret_room()).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match sync.next_event().await {
                    Some(SyncEvent::Resynced { .. }) => break,
                    Some(_) => {}
                    None => panic!("sync task stopped"),
                }
            }
        })
        .await
        .expect("no resync");
        Self { store, sync }
    }

    async fn wait_for(&self, mut pred: impl FnMut(&ConversationStore) -> bool) {
        let mut revision = self.store.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
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

    /// Waits for `count` messages and returns their content and tags.
    async fn contents(&self, count: usize) -> Vec<(MessageContent, EncryptionTag)> {
        self.wait_for(|s| s.messages(&secret_room()).len() >= count)
            .await;
        self.store.read(|s| {
            s.messages(&secret_room())
                .iter()
                .map(|m| (m.content.clone(), m.encryption))
                .collect()
        })
    }
}

async fn alice_sends(backend: &MemoryBackend, text: &str) {
    let (store, _effects) = StoreHandle::new(PrincipalId::new("alice"));
    let pipeline = SendPipeline::new(
        Arc::new(backend.clone()),
        store,
        PrincipalId::new("alice"),
        true,
        Some(cipher(KEY_HEX)),
    );
    let sender = pipeline.open_conversation(secret_room());
    assert!(sender.is_encrypted());
    let outcome = sender.send(text).unwrap().outcome().await;
    assert!(matches!(outcome, Some(SendOutcome::Sent(_))));
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn backend_only_stores_sealed_bytes() {
    let backend = backend();
    alice_sends(&backend, "the eagle lands at noon").await;

    let stored = backend.messages(&secret_room());
    assert_eq!(stored.len(), 1);
    let MessageBody::Sealed(sealed) = &stored[0].body else {
        panic!("body was stored in the clear");
    };
    let needle = b"eagle";
    assert!(
        !sealed
            .ciphertext
            .windows(needle.len())
            .any(|window| window == needle)
    );
}

#[tokio::test]
async fn shared_key_reader_sees_plaintext() {
    let backend = backend();
    let bob = Reader::start(
        &backend,
        "bob",
        MessageEnvelope::new(true, Some(cipher(KEY_HEX))),
    )
    .await;

    alice_sends(&backend, "meet at the usual place").await;
    let contents = bob.contents(1).await;
    assert_eq!(
        contents,
        [(
            MessageContent::Text("meet at the usual place".into()),
            EncryptionTag::Encrypted
        )]
    );
    bob.sync.shutdown().await;
}

#[tokio::test]
async fn wrong_key_shows_decryption_failure() {
    let backend = backend();
    alice_sends(&backend, "for bob only").await;

    let carol = Reader::start(
        &backend,
        "carol",
        MessageEnvelope::new(true, Some(cipher(OTHER_KEY_HEX))),
    )
    .await;
    let contents = carol.contents(1).await;
    assert_eq!(
        contents[0].0,
        MessageContent::Unavailable(UnavailableReason::DecryptionFailed)
    );
    assert_eq!(contents[0].1, EncryptionTag::Encrypted);

    // The conversation list still works with a placeholder preview.
    let preview = carol.store.read(|s| {
        s.conversation(&secret_room())
            .and_then(|c| c.last_message_preview.clone())
    });
    assert_eq!(preview.as_deref(), Some("[content unavailable]"));
    carol.sync.shutdown().await;
}

#[tokio::test]
async fn disabled_reader_sees_placeholder_and_plain_text() {
    let backend = backend();
    let dave = Reader::start(&backend, "dave", MessageEnvelope::disabled()).await;

    alice_sends(&backend, "sealed").await;
    backend
        .post(&secret_room(), &PrincipalId::new("bob"), "in the clear")
        .unwrap();

    let contents = dave.contents(2).await;
    assert_eq!(
        contents,
        [
            (
                MessageContent::Unavailable(UnavailableReason::EncryptionDisabled),
                EncryptionTag::Encrypted
            ),
            (
                MessageContent::Text("in the clear".into()),
                EncryptionTag::Unencrypted
            ),
        ]
    );
    dave.sync.shutdown().await;
}

#[tokio::test]
async fn unknown_envelope_version_is_reported() {
    let backend = backend();
    let bob = Reader::start(
        &backend,
        "bob",
        MessageEnvelope::new(true, Some(cipher(KEY_HEX))),
    )
    .await;

    backend
        .send_message(SendRequest {
            conversation_id: secret_room(),
            sender_id: PrincipalId::new("carol"),
            body: MessageBody::Sealed(SealedEnvelope {
                version: 9,
                nonce: vec![0; 12],
                ciphertext: vec![1, 2, 3],
            }),
            client_id: ClientId::new(),
        })
        .await
        .unwrap();

    let contents = bob.contents(1).await;
    assert_eq!(
        contents[0].0,
        MessageContent::Unavailable(UnavailableReason::UnsupportedEnvelope(9))
    );
    bob.sync.shutdown().await;
}

#[tokio::test]
async fn tampered_ciphertext_is_not_shown() {
    let backend = backend();
    let sealed = ChaChaCipher::from_hex(KEY_HEX)
        .unwrap()
        .encrypt(b"original")
        .unwrap();
    let mut tampered = sealed.clone();
    if let Some(byte) = tampered.ciphertext.first_mut() {
        *byte ^= 0x01;
    }

    let bob = Reader::start(
        &backend,
        "bob",
        MessageEnvelope::new(true, Some(cipher(KEY_HEX))),
    )
    .await;
    for body in [tampered, sealed] {
        backend
            .send_message(SendRequest {
                conversation_id: secret_room(),
                sender_id: PrincipalId::new("alice"),
                body: MessageBody::Sealed(body),
                client_id: ClientId::new(),
            })
            .await
            .unwrap();
    }

    let contents = bob.contents(2).await;
    assert_eq!(
        contents[0].0,
        MessageContent::Unavailable(UnavailableReason::DecryptionFailed)
    );
    assert_eq!(contents[1].0, MessageContent::Text("original".into()));
    bob.sync.shutdown().await;
}
