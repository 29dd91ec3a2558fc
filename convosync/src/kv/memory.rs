//! In-memory [`KeyValueStore`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{KeyValueStore, KvChange, KvError};

const CHANGE_CAPACITY: usize = 64;

/// In-memory store. Clones share data and the change broadcast, so two
/// clones behave like two tabs over one browser storage.
#[derive(Clone)]
pub struct MemoryKv {
    data: Arc<Mutex<HashMap<String, String>>>,
    changes: Option<broadcast::Sender<KvChange>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Creates an empty store that announces changes.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            data: Arc::default(),
            changes: Some(tx),
        }
    }

    /// Creates an empty store without change notifications.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            data: Arc::default(),
            changes: None,
        }
    }

    fn announce(&self, key: &str, value: Option<&str>) {
        if let Some(tx) = &self.changes {
            let _ = tx.send(KvChange {
                key: key.to_string(),
                value: value.map(str::to_string),
            });
        }
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let previous = self.data.lock().insert(key.to_string(), value.to_string());
        if previous.as_deref() != Some(value) {
            self.announce(key, Some(value));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        if self.data.lock().remove(key).is_some() {
            self.announce(key, None);
        }
        Ok(())
    }

    fn watch(&self) -> Option<broadcast::Receiver<KvChange>> {
        self.changes.as_ref().map(broadcast::Sender::subscribe)
    }
}
