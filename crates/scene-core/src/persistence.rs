//! LocalData: debounced, never-regress writer of the scene to durable storage.
//!
//! # Write path
//!
//! 1. `save` stores the latest snapshot in a debouncer; rapid edits coalesce.
//! 2. When the debouncer fires (`tick`) or is forced (`flush_save`), the stored
//!    version record is read first. If a sibling replica wrote newer elements
//!    since the snapshot was taken, they are reconciled into the snapshot and
//!    the merged collection is what gets written.
//! 3. Asset bytes are cached before the metadata that references them.
//! 4. Elements, app state and the version record go through one
//!    `write_batch`. Every written version is `max(stored, known) + 1`.
//! 5. A failed write puts the snapshot back, unless a newer one was
//!    scheduled while it ran, so the next tick or flush retries it.
//!
//! Storage is shared between replicas without locks. Two replicas that read
//! the record at the same moment can both write; the next read on either
//! side re-reconciles, so nothing is lost for good.

use crate::app_state::AppStateSubset;
use crate::clock::Clock;
use crate::debounce::Debouncer;
use crate::element::{Element, FileId, parse_elements, serialize_elements};
use crate::events::{Anomaly, EventBus, SceneEvent};
use crate::files::{BinaryFile, FileManager, SaveFilesOutcome};
use crate::library::{LibraryItem, parse_library, serialize_library};
use crate::reconcile::reconcile;
use crate::storage::{Storage, StorageError, keys};
use crate::versions::{StateKey, VersionDataState, VersionEntry, read_version_state};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Everything one save writes.
#[derive(Debug, Clone, Default)]
pub struct SceneSnapshot {
    pub elements: Vec<Arc<Element>>,
    pub app_state: AppStateSubset,
    pub files: HashMap<FileId, Arc<BinaryFile>>,
}

/// Durable state as found at session start.
#[derive(Debug, Clone, Default)]
pub struct LoadedScene {
    pub elements: Vec<Arc<Element>>,
    pub app_state: Option<AppStateSubset>,
    pub library: Vec<LibraryItem>,
    pub versions: VersionDataState,
}

/// Outcome of one completed write.
#[derive(Debug, Clone)]
pub struct SaveReport {
    /// Version record as written.
    pub versions: VersionDataState,
    /// Set when newer stored elements were merged into the snapshot.
    pub merged: Option<Vec<Arc<Element>>>,
    pub files: SaveFilesOutcome,
}

pub type SaveCallback = Box<dyn FnOnce(&SaveReport) + Send>;

struct PendingSave {
    snapshot: SceneSnapshot,
    /// Known elements version when the snapshot was taken.
    base: VersionEntry,
    on_complete: Option<SaveCallback>,
}

impl fmt::Debug for PendingSave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSave")
            .field("elements", &self.snapshot.elements.len())
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

pub struct LocalData {
    storage: Arc<dyn Storage>,
    files: Arc<FileManager>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    pending: Mutex<Debouncer<PendingSave>>,
    paused: AtomicBool,
    /// Last version record this replica wrote or imported.
    known: Mutex<VersionDataState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl LocalData {
    pub fn new(
        storage: Arc<dyn Storage>,
        files: Arc<FileManager>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        save_debounce: Duration,
    ) -> Self {
        Self {
            storage,
            files,
            clock,
            events,
            pending: Mutex::new(Debouncer::new(save_debounce)),
            paused: AtomicBool::new(false),
            known: Mutex::new(VersionDataState::default()),
        }
    }

    /// Import the persisted scene and adopt its version record as known.
    ///
    /// Corrupt blobs read as "no prior state" and raise a notice.
    pub async fn load(&self) -> Result<LoadedScene> {
        let versions = read_version_state(self.storage.as_ref()).await?;
        let elements = self.read_elements().await?;
        let app_state = self.read_app_state().await?;
        let library = self.read_library().await?;
        *lock(&self.known) = versions;

        info!(
            "Loaded {} elements (elements version {})",
            elements.len(),
            versions.elements.version
        );
        Ok(LoadedScene {
            elements,
            app_state,
            library,
            versions,
        })
    }

    /// Read the persisted element collection. Missing or corrupt reads as empty.
    pub async fn read_elements(&self) -> Result<Vec<Arc<Element>>> {
        let Some(bytes) = self.storage.get(keys::ELEMENTS).await? else {
            return Ok(Vec::new());
        };
        match parse_elements(&bytes) {
            Ok(elements) => Ok(elements),
            Err(e) => {
                self.report_corruption(keys::ELEMENTS, &e);
                Ok(Vec::new())
            }
        }
    }

    /// Read the persisted app state. Missing or corrupt reads as `None`.
    pub async fn read_app_state(&self) -> Result<Option<AppStateSubset>> {
        let Some(bytes) = self.storage.get(keys::APP_STATE).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                self.report_corruption(keys::APP_STATE, &e);
                Ok(None)
            }
        }
    }

    /// Read the persisted library. Missing or corrupt reads as empty.
    pub async fn read_library(&self) -> Result<Vec<LibraryItem>> {
        let Some(bytes) = self.storage.get(keys::LIBRARY).await? else {
            return Ok(Vec::new());
        };
        match parse_library(&bytes) {
            Ok(items) => Ok(items),
            Err(e) => {
                self.report_corruption(keys::LIBRARY, &e);
                Ok(Vec::new())
            }
        }
    }

    /// Write the library right away, with its own version entry.
    ///
    /// Library edits are rare and not tied to the scene, so they bypass the
    /// save debounce and are written even while scene saving is paused.
    pub async fn save_library(&self, items: &[LibraryItem]) -> Result<VersionEntry> {
        let stored = read_version_state(self.storage.as_ref()).await?;
        let known = self.known_versions();
        let mut versions = merged_record(&stored, &known);
        versions.library = VersionEntry::next_after(stored.library, known.library, self.clock.now_ms());

        self.storage
            .write_batch(vec![
                (keys::LIBRARY.to_string(), serialize_library(items)?),
                (keys::VERSION_DATA_STATE.to_string(), serde_json::to_vec(&versions)?),
            ])
            .await?;
        self.observe(StateKey::Library, versions.library);

        debug!("Saved {} library items at version {}", items.len(), versions.library.version);
        Ok(versions.library)
    }

    /// Read the version record currently in storage.
    pub async fn stored_versions(&self) -> Result<VersionDataState> {
        Ok(read_version_state(self.storage.as_ref()).await?)
    }

    fn report_corruption(&self, key: &str, error: &serde_json::Error) {
        warn!("Corrupt {} in storage, treating as empty: {}", key, error);
        self.events
            .notice(Anomaly::StorageCorruption, format!("{}: {}", key, error));
    }

    /// Version record this replica last wrote or imported.
    pub fn known_versions(&self) -> VersionDataState {
        *lock(&self.known)
    }

    /// Record that this replica has caught up with `entry` for `key`.
    pub fn observe(&self, key: StateKey, entry: VersionEntry) {
        let mut known = lock(&self.known);
        let current = known.get(key);
        known.set(key, current.max(entry));
    }

    /// Schedule a debounced write of `snapshot`.
    ///
    /// Replaces any pending snapshot; only the latest `on_complete` runs.
    /// Returns false (and schedules nothing) while saving is paused.
    pub fn save(&self, snapshot: SceneSnapshot, on_complete: Option<SaveCallback>) -> bool {
        if self.is_save_paused() {
            debug!("Save paused, dropping snapshot");
            return false;
        }
        let now = self.clock.now_ms();
        let base = self.known_versions().elements;
        lock(&self.pending).schedule(
            PendingSave {
                snapshot,
                base,
                on_complete,
            },
            now,
        );
        true
    }

    /// Run the pending write if its debounce window has passed.
    pub async fn tick(&self) -> Result<Option<SaveReport>> {
        let now = self.clock.now_ms();
        let due = lock(&self.pending).take_due(now);
        match due {
            Some(pending) => self.run(pending).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run the pending write now (unload, blur, hidden).
    pub async fn flush_save(&self) -> Result<Option<SaveReport>> {
        let pending = lock(&self.pending).flush();
        match pending {
            Some(pending) => self.run(pending).await.map(Some),
            None => Ok(None),
        }
    }

    /// Drop the pending write. Returns true if one was pending.
    pub fn cancel_save(&self) -> bool {
        lock(&self.pending).cancel()
    }

    pub fn has_pending_save(&self) -> bool {
        lock(&self.pending).is_pending()
    }

    /// Deadline of the pending write, if any.
    pub fn save_due_at(&self) -> Option<u64> {
        lock(&self.pending).due_at()
    }

    pub fn pause_save(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_save(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_save_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Closing now would lose asset bytes.
    ///
    /// While saving is paused the local cache is not where assets end up, so
    /// only writes already running count.
    pub fn should_prevent_unload(
        &self,
        elements: &[Arc<Element>],
        files: &HashMap<FileId, Arc<BinaryFile>>,
    ) -> bool {
        if self.is_save_paused() {
            return self.files.has_saves_in_flight(elements);
        }
        self.files.should_prevent_unload(elements, files)
    }

    async fn run(&self, pending: PendingSave) -> Result<SaveReport> {
        match self.write(&pending.snapshot, pending.base).await {
            Ok(report) => {
                if let Some(callback) = pending.on_complete {
                    callback(&report);
                }
                Ok(report)
            }
            Err(e) => {
                let now = self.clock.now_ms();
                if lock(&self.pending).reschedule_if_empty(pending, now) {
                    warn!("Save failed, retrying after the debounce: {}", e);
                } else {
                    warn!("Save failed, a newer snapshot is already pending: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn write(&self, snapshot: &SceneSnapshot, base: VersionEntry) -> Result<SaveReport> {
        let stored = read_version_state(self.storage.as_ref()).await?;
        let known = self.known_versions();

        let mut elements = snapshot.elements.clone();
        let mut merged = None;
        // Compare against the snapshot's base, not `known`: elements imported
        // after the snapshot was taken are missing from it.
        if stored.elements.is_newer_than(&base) {
            let theirs = self.read_elements().await?;
            debug!(
                "Stored elements v{} newer than snapshot base v{}, merging {} before write",
                stored.elements.version,
                base.version,
                theirs.len()
            );
            elements = reconcile(&elements, &theirs);
            merged = Some(elements.clone());
        }

        let files = self.files.save_files(&elements, &snapshot.files).await;

        let now = self.clock.now_ms();
        let mut versions = merged_record(&stored, &known);
        versions.elements = VersionEntry::next_after(stored.elements, known.elements, now);
        versions.app_state = VersionEntry::next_after(stored.app_state, known.app_state, now);
        if !files.saved_files.is_empty() {
            versions.files = VersionEntry::next_after(stored.files, known.files, now);
        }

        self.storage
            .write_batch(vec![
                (keys::ELEMENTS.to_string(), serialize_elements(&elements)?),
                (keys::APP_STATE.to_string(), serde_json::to_vec(&snapshot.app_state)?),
                (keys::VERSION_DATA_STATE.to_string(), serde_json::to_vec(&versions)?),
            ])
            .await?;
        *lock(&self.known) = versions;

        debug!(
            "Saved {} elements at version {}",
            elements.len(),
            versions.elements.version
        );
        self.events.emit(SceneEvent::SaveCompleted {
            elements_version: versions.elements.version,
            saved_files: files.saved_files.len(),
            errored_files: files.errored_files.len(),
        });

        Ok(SaveReport {
            versions,
            merged,
            files,
        })
    }
}

/// Newer entry per key; the starting point of every written record, so a
/// write never rolls back a key it does not touch.
fn merged_record(stored: &VersionDataState, known: &VersionDataState) -> VersionDataState {
    let mut record = VersionDataState::default();
    for key in StateKey::ALL {
        record.set(key, stored.get(key).max(known.get(key)));
    }
    record
}
