//! Storage directory watcher with debouncing.
//!
//! Sibling replicas only share the storage directory, so a change to one of
//! its keys is the cue to run a staleness check. Uses notify-debouncer-mini
//! to collapse the burst of events a single batch write produces.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use scene_core::storage::keys;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Change to one storage key.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    /// Storage key (`elements-blob`, `files/<id>`, ...)
    pub key: String,
    pub kind: StorageEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEventKind {
    /// Key was written
    Modified,
    /// Key was removed
    Deleted,
}

/// Watches a storage directory for writes by other processes.
pub struct StorageWatcher {
    storage_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<StorageEvent>,
}

/// Last seen mtime per key, to drop events that did not change content
type MtimeCache = Arc<Mutex<HashMap<String, SystemTime>>>;

impl StorageWatcher {
    /// Create a watcher for the storage directory, creating it if needed.
    ///
    /// Uses a 200ms debounce period.
    pub fn new(storage_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&storage_path)?;
        // FSEvents on macOS needs the real path (/var -> /private/var)
        let storage_path = storage_path.canonicalize().unwrap_or(storage_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root = storage_path.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(storage_event) = Self::process_event(&event, &root, &mtime_cache) {
                            if event_tx.send(storage_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Storage watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&storage_path, RecursiveMode::Recursive)?;

        Ok(Self {
            storage_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Map a debounced event to a storage key event, if it names one.
    fn process_event(
        event: &DebouncedEvent,
        storage_path: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<StorageEvent> {
        let path = &event.path;
        let key = storage_key(path.strip_prefix(storage_path).ok()?)?;

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        let kind = match std::fs::metadata(path).and_then(|metadata| metadata.modified()) {
            Ok(mtime) => {
                if cache.get(&key) == Some(&mtime) {
                    return None;
                }
                cache.insert(key.clone(), mtime);
                StorageEventKind::Modified
            }
            Err(_) if !path.exists() => {
                cache.remove(&key);
                StorageEventKind::Deleted
            }
            Err(_) => StorageEventKind::Modified,
        };
        drop(cache);

        debug!("Storage event: {:?} - {}", kind, key);
        Some(StorageEvent { key, kind })
    }

    /// Get the receiver for storage events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<StorageEvent> {
        &mut self.event_rx
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }
}

/// Storage key for a path relative to the storage directory. Temp files,
/// hidden entries and unrelated files yield `None`.
fn storage_key(relative: &Path) -> Option<String> {
    let parts = relative
        .components()
        .map(|component| component.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() || parts.iter().any(|part| part.starts_with('.')) {
        return None;
    }
    let key = parts.join("/");

    let known = key == keys::ELEMENTS
        || key == keys::APP_STATE
        || key == keys::VERSION_DATA_STATE
        || key == keys::LIBRARY
        || keys::file_id(&key).is_some_and(|id| !id.as_str().contains('/'));
    known.then_some(key)
}
