//! JSON-file [`KeyValueStore`].
//!
//! Every read loads the file so writes from other processes are seen.
//! Each read-modify-write holds an exclusive lock on a sibling `.lock`
//! file for its whole cycle, so concurrent writers in other processes
//! cannot drop each other's keys. The new map is written to a uniquely
//! named temporary file that is renamed over the target, so readers never
//! observe a half-written file. There is no change notification; sessions
//! using this store poll.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write as _};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::sync::broadcast;

use super::{KeyValueStore, KvChange, KvError};

/// File-backed store.
#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileKv {
    /// Opens (without creating) a store at `path`. The parent directory is
    /// created on first write.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, KvError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|e| KvError::Corrupt(e.to_string()))
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(KvError::Io(e)),
        }
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn save(&self, data: &BTreeMap<String, String>) -> Result<(), KvError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| KvError::Corrupt(e.to_string()))?;
        let mut tmp = NamedTempFile::new_in(self.parent_dir())?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| KvError::Io(e.error))?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> bool) -> Result<(), KvError> {
        let _guard = self.write_lock.lock();
        std::fs::create_dir_all(self.parent_dir())?;
        let _lock = FileLock::acquire(&self.path)?;
        let mut data = self.load()?;
        if f(&mut data) {
            self.save(&data)?;
        }
        Ok(())
    }
}

/// Exclusive cross-process lock, released when dropped.
///
/// The lock file is left in place: unlinking it would let a waiting
/// process lock an orphaned inode while a newcomer locks a fresh one.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self, KvError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.with_extension("lock"))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "failed to release state file lock");
        }
    }
}

impl KeyValueStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.update(|data| {
            data.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.update(|data| data.remove(key).is_some())
    }

    fn watch(&self) -> Option<broadcast::Receiver<KvChange>> {
        None
    }
}
