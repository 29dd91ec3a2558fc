//! Shared handle to a [`ConversationStore`].

use std::sync::Arc;

use convosync_proto::message::PrincipalId;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{Action, ConversationStore, StoreEffect};

/// Receiving side of the effect channel.
pub type EffectReceiver = mpsc::UnboundedReceiver<StoreEffect>;

struct Inner {
    store: Mutex<ConversationStore>,
    effects: mpsc::UnboundedSender<StoreEffect>,
    revision: watch::Sender<u64>,
}

/// Cloneable handle that serializes reducer applications.
///
/// Actions are applied one at a time in the order `dispatch` acquires the
/// lock. Effects are forwarded on an unbounded channel in the same order,
/// and every applied action bumps a revision observers can watch.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Inner>,
}

impl StoreHandle {
    /// Creates an empty store for `viewer`, returning the handle and the
    /// receiver for the effects the store asks for.
    #[must_use]
    pub fn new(viewer: PrincipalId) -> (Self, EffectReceiver) {
        Self::from_store(ConversationStore::new(viewer))
    }

    /// Wraps an existing store.
    #[must_use]
    pub fn from_store(store: ConversationStore) -> (Self, EffectReceiver) {
        let (effects, rx) = mpsc::unbounded_channel();
        let (revision, _) = watch::channel(0);
        let handle = Self {
            inner: Arc::new(Inner {
                store: Mutex::new(store),
                effects,
                revision,
            }),
        };
        (handle, rx)
    }

    /// Applies an action and forwards its effects. Returns the number of
    /// effects produced.
    pub fn dispatch(&self, action: Action) -> usize {
        let mut store = self.inner.store.lock();
        let effects = store.apply(action);
        let count = effects.len();
        for effect in effects {
            if self.inner.effects.send(effect).is_err() {
                tracing::debug!("effect receiver dropped, effect discarded");
            }
        }
        drop(store);
        self.inner.revision.send_modify(|rev| *rev += 1);
        count
    }

    /// Runs `f` against the current state.
    pub fn read<R>(&self, f: impl FnOnce(&ConversationStore) -> R) -> R {
        let store = self.inner.store.lock();
        f(&*store)
    }

    /// Clones the current state.
    #[must_use]
    pub fn snapshot(&self) -> ConversationStore {
        self.inner.store.lock().clone()
    }

    /// Watches the revision counter; it changes after every dispatch.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("revision", &*self.inner.revision.borrow())
            .finish_non_exhaustive()
    }
}
