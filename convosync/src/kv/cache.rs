//! Namespaced cache entries with independent expiry, stored under
//! `cache.<namespace>` keys.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{KeyValueStore, KvError};

/// Key prefix for cache entries.
pub const CACHE_PREFIX: &str = "cache.";

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// Cache over a [`KeyValueStore`].
#[derive(Clone)]
pub struct TtlCache {
    store: Arc<dyn KeyValueStore>,
}

impl TtlCache {
    /// Wraps `store`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(namespace: &str) -> String {
        format!("{CACHE_PREFIX}{namespace}")
    }

    /// Stores `value` under `namespace` until `now + ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the value cannot be serialized or written.
    pub fn put<T: Serialize>(
        &self,
        namespace: &str,
        value: &T,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), KvError> {
        let entry = Entry {
            value: serde_json::to_value(value).map_err(|e| KvError::Corrupt(e.to_string()))?,
            expires_at: now + ttl,
        };
        let json = serde_json::to_string(&entry).map_err(|e| KvError::Corrupt(e.to_string()))?;
        self.store.set(&Self::key(namespace), &json)
    }

    /// Reads `namespace`. Expired or unreadable entries are removed and
    /// reported as absent.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] only if the store itself fails.
    pub fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<T>, KvError> {
        let key = Self::key(namespace);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };
        let parsed = serde_json::from_str::<Entry>(&raw)
            .ok()
            .filter(|entry| entry.expires_at > now)
            .and_then(|entry| serde_json::from_value(entry.value).ok());
        if parsed.is_none() {
            tracing::debug!(namespace, "dropping expired or unreadable cache entry");
            self.store.remove(&key)?;
        }
        Ok(parsed)
    }

    /// Removes `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the store cannot be written.
    pub fn invalidate(&self, namespace: &str) -> Result<(), KvError> {
        self.store.remove(&Self::key(namespace))
    }
}
