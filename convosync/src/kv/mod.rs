//! Shared persistent key-value store.
//!
//! Every open instance of the application sees the same store; writes are
//! last-writer-wins. Stores that can announce changes return a broadcast
//! receiver from [`KeyValueStore::watch`]; the others are polled.

pub mod cache;
pub mod file;
pub mod memory;

pub use cache::TtlCache;
pub use file::FileKv;
pub use memory::MemoryKv;

use tokio::sync::broadcast;

use crate::error::ErrorKind;

/// Errors from the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Reading or writing the backing file failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be parsed.
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

impl KvError {
    /// Maps this error onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::Storage
    }
}

/// A change made through any handle to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvChange {
    /// Changed key.
    pub key: String,
    /// New value, or `None` if removed.
    pub value: Option<String>,
}

/// String key-value storage shared between application instances.
pub trait KeyValueStore: Send + Sync {
    /// Reads a value.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Writes a value.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the store cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Deletes a value. Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the store cannot be written.
    fn remove(&self, key: &str) -> Result<(), KvError>;

    /// Subscribes to changes, or `None` if this store cannot announce them
    /// and must be polled.
    fn watch(&self) -> Option<broadcast::Receiver<KvChange>>;
}
