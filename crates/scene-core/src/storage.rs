//! Storage trait abstraction for durable, replica-shared key/value state.
//!
//! Implementations:
//! - `InMemoryStorage` - For testing (share one `Arc` between sessions to
//!   simulate sibling tabs)
//! - `NativeStorage` (in scene-daemon) - One file per key via tokio::fs
//!
//! Durable storage is the only resource replicas share. Nothing here locks:
//! coordination is advisory through the version record (see `versions`).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Logical storage keys.
pub mod keys {
    use crate::element::FileId;

    /// Serialized element collection (tombstones included).
    pub const ELEMENTS: &str = "elements-blob";
    /// Persisted app-state subset.
    pub const APP_STATE: &str = "app-state-blob";
    /// Saved library items, shared by every scene.
    pub const LIBRARY: &str = "library-blob";
    /// Per-key `{version, timestamp}` record.
    pub const VERSION_DATA_STATE: &str = "version-data-state";
    /// Prefix of cached asset entries (the logical `files-blob`).
    pub const FILES_PREFIX: &str = "files/";

    pub fn file(id: &FileId) -> String {
        format!("{}{}", FILES_PREFIX, id)
    }

    pub fn file_id(key: &str) -> Option<FileId> {
        key.strip_prefix(FILES_PREFIX)
            .filter(|rest| !rest.is_empty())
            .map(FileId::new)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable key/value storage shared by all replicas of a document.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a value. Missing keys are `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write several entries as one unit.
    ///
    /// Payloads and the version record that describes them are written
    /// through a single call so readers never see one without the other.
    async fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Write a single entry.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.write_batch(vec![(key.to_string(), value)]).await
    }
}

/// In-memory storage for testing
#[derive(Default)]
pub struct InMemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Number of `write_batch` calls, for asserting coalescing in tests
    batches: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Overwrite a raw entry (simulates corruption or an out-of-band writer).
    pub fn put_raw(&self, key: &str, value: &[u8]) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_vec());
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        if let Some((key, _)) = entries.iter().find(|(key, _)| key.is_empty()) {
            return Err(StorageError::InvalidKey(key.clone()));
        }
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for (key, value) in entries {
            map.insert(key, value);
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// Lets several sessions share one storage in tests.
#[async_trait]
impl<T: Storage> Storage for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        (**self).write_batch(entries).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).keys(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::FileId;

    #[tokio::test]
    async fn test_in_memory_storage_basic_operations() {
        let storage = InMemoryStorage::new();

        storage.set("a", b"hello".to_vec()).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(storage.get("missing").await.unwrap(), None);

        storage.delete("a").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
        storage.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_batch_and_prefix_listing() {
        let storage = InMemoryStorage::new();
        storage
            .write_batch(vec![
                (keys::file(&FileId::new("one")), vec![1]),
                (keys::file(&FileId::new("two")), vec![2]),
                (keys::ELEMENTS.to_string(), b"[]".to_vec()),
            ])
            .await
            .unwrap();

        let mut listed = storage.keys(keys::FILES_PREFIX).await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["files/one", "files/two"]);
        assert_eq!(storage.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_key() {
        let storage = InMemoryStorage::new();
        let result = storage.write_batch(vec![(String::new(), vec![])]).await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn test_file_key_roundtrip() {
        let key = keys::file(&FileId::new("abc"));
        assert_eq!(key, "files/abc");
        assert_eq!(keys::file_id(&key), Some(FileId::new("abc")));
        assert_eq!(keys::file_id("files/"), None);
        assert_eq!(keys::file_id(keys::ELEMENTS), None);
    }
}
