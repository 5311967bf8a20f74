//! Binary assets referenced by image elements.
//!
//! `FileManager` tracks the sync state of every asset a session has touched:
//! - `fetching`: an in-flight retrieval, shared by every caller that asks for
//!   the same id while it runs
//! - `saving`: bytes being written to the local cache
//! - `saved`: durably available (cached locally or held by the remote source)
//! - `errored`: the last fetch or save failed; retried on the next cycle
//!
//! Cached entries live under `files/<id>` as a one-line JSON header followed
//! by the raw bytes.

use crate::clock::Clock;
use crate::element::{Element, FileId, ImageStatus};
use crate::events::{Anomaly, ChangeOrigin, EventBus};
use crate::storage::{Storage, StorageError, keys};
use crate::store::SceneStore;
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cached assets unused for this long are removed by `clear_obsolete`.
pub const OBSOLETE_FILE_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Saved,
    Error,
}

/// A binary asset held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryFile {
    pub id: FileId,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// Milliseconds since epoch when the asset was first added.
    pub created: u64,
    pub last_retrieved: Option<u64>,
    pub status: FileStatus,
}

impl BinaryFile {
    /// A freshly inserted asset whose bytes are not yet cached.
    pub fn new(id: FileId, mime_type: impl Into<String>, data: Vec<u8>, created: u64) -> Self {
        Self {
            id,
            mime_type: mime_type.into(),
            data,
            created,
            last_retrieved: None,
            status: FileStatus::Pending,
        }
    }

    /// Placeholder recorded for an asset that could not be retrieved.
    fn errored(id: FileId) -> Self {
        Self {
            id,
            mime_type: String::new(),
            data: Vec::new(),
            created: 0,
            last_retrieved: None,
            status: FileStatus::Error,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedHeader {
    id: FileId,
    mime_type: String,
    created: u64,
    #[serde(default)]
    last_retrieved: Option<u64>,
}

fn encode_cached(file: &BinaryFile, last_retrieved: u64) -> Vec<u8> {
    let header = CachedHeader {
        id: file.id.clone(),
        mime_type: file.mime_type.clone(),
        created: file.created,
        last_retrieved: Some(last_retrieved),
    };
    // Compact JSON escapes newlines inside strings, so the first '\n' ends the header.
    let mut bytes = serde_json::to_vec(&header).unwrap_or_default();
    bytes.push(b'\n');
    bytes.extend_from_slice(&file.data);
    bytes
}

fn decode_cached(bytes: &[u8]) -> Option<BinaryFile> {
    let split = bytes.iter().position(|b| *b == b'\n')?;
    let header: CachedHeader = serde_json::from_slice(&bytes[..split]).ok()?;
    Some(BinaryFile {
        id: header.id,
        mime_type: header.mime_type,
        data: bytes[split + 1..].to_vec(),
        created: header.created,
        last_retrieved: header.last_retrieved,
        status: FileStatus::Saved,
    })
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote source error: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Result of one retrieval attempt. Ids never appear in both sets.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub loaded_files: Vec<BinaryFile>,
    pub errored_files: HashSet<FileId>,
}

impl FetchOutcome {
    pub fn is_empty(&self) -> bool {
        self.loaded_files.is_empty() && self.errored_files.is_empty()
    }
}

/// Remote blob store holding the assets of shared scenes and rooms.
///
/// Fetching is idempotent; ids the source does not return count as errored.
#[async_trait]
pub trait RemoteFileSource: Send + Sync {
    async fn fetch_files(
        &self,
        container: &str,
        access_key: &str,
        ids: &[FileId],
    ) -> Result<FetchOutcome>;
}

/// Where assets missing from the local cache are retrieved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Local cache only.
    Local,
    /// Local cache, then the remote container.
    Remote { container: String, access_key: String },
}

/// Files written (or retried) by one `save_files` pass, sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveFilesOutcome {
    pub saved_files: Vec<FileId>,
    pub errored_files: Vec<FileId>,
}

/// Future returned by `resolve_missing`; the host spawns or awaits it.
pub type ResolveTask = BoxFuture<'static, FetchOutcome>;

type SharedFetch = Shared<BoxFuture<'static, Arc<FetchOutcome>>>;

#[derive(Default)]
struct FileTracking {
    fetching: HashMap<FileId, SharedFetch>,
    saving: HashSet<FileId>,
    saved: HashSet<FileId>,
    errored: HashSet<FileId>,
}

fn lock(tracking: &Mutex<FileTracking>) -> MutexGuard<'_, FileTracking> {
    tracking.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct FileManager {
    storage: Arc<dyn Storage>,
    remote: Option<Arc<dyn RemoteFileSource>>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    tracking: Arc<Mutex<FileTracking>>,
    obsolete_cleared: AtomicBool,
}

impl FileManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        remote: Option<Arc<dyn RemoteFileSource>>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            storage,
            remote,
            clock,
            events,
            tracking: Arc::new(Mutex::new(FileTracking::default())),
            obsolete_cleared: AtomicBool::new(false),
        }
    }

    pub fn is_fetching(&self, id: &FileId) -> bool {
        lock(&self.tracking).fetching.contains_key(id)
    }

    pub fn is_saving(&self, id: &FileId) -> bool {
        lock(&self.tracking).saving.contains(id)
    }

    pub fn is_saved(&self, id: &FileId) -> bool {
        lock(&self.tracking).saved.contains(id)
    }

    pub fn is_errored(&self, id: &FileId) -> bool {
        lock(&self.tracking).errored.contains(id)
    }

    /// Retrieve `ids`: local cache first, then `source`.
    pub async fn fetch(&self, ids: impl IntoIterator<Item = FileId>, source: &FileSource) -> FetchOutcome {
        self.begin_fetch(ids, source).await
    }

    /// Start fetching assets referenced by `elements` that the store lacks.
    ///
    /// Registration happens before this returns, so a second call for the
    /// same ids attaches to the running fetch. Completion adds loaded files
    /// to the store and flags the elements of errored files. Returns `None`
    /// when nothing is missing.
    pub fn resolve_missing(
        &self,
        elements: &[Arc<Element>],
        store: &Arc<SceneStore>,
        source: &FileSource,
    ) -> Option<ResolveTask> {
        let mut seen = HashSet::new();
        let missing: Vec<FileId> = referenced_files(elements)
            .filter(|id| match store.file(id) {
                None => true,
                Some(file) => file.status == FileStatus::Error,
            })
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();
        if missing.is_empty() {
            return None;
        }

        debug!("Resolving {} missing files", missing.len());
        let fetch = self.begin_fetch(missing, source);
        let store = Arc::clone(store);
        let events = Arc::clone(&self.events);

        Some(
            async move {
                let outcome = fetch.await;
                store.add_files(outcome.loaded_files.iter().cloned());

                if !outcome.errored_files.is_empty() {
                    store.add_files(outcome.errored_files.iter().cloned().map(BinaryFile::errored));
                    store.update_elements(ChangeOrigin::Status, |current| {
                        update_stale_image_statuses(&outcome.errored_files, current)
                    });
                    events.notice(
                        Anomaly::FetchFailure,
                        format!("{} file(s) could not be loaded", outcome.errored_files.len()),
                    );
                }
                outcome
            }
            .boxed(),
        )
    }

    fn begin_fetch(
        &self,
        ids: impl IntoIterator<Item = FileId>,
        source: &FileSource,
    ) -> BoxFuture<'static, FetchOutcome> {
        let mut tracking = lock(&self.tracking);
        let mut requested = HashSet::new();
        let mut attached: Vec<SharedFetch> = Vec::new();
        let mut fresh = Vec::new();

        for id in ids {
            if !requested.insert(id.clone()) {
                continue;
            }
            match tracking.fetching.get(&id) {
                Some(running) => {
                    debug!("Attaching to in-flight fetch of {}", id);
                    attached.push(running.clone());
                }
                None => fresh.push(id),
            }
        }

        if !fresh.is_empty() {
            let batch = fetch_batch(
                Arc::clone(&self.storage),
                self.remote.clone(),
                Arc::clone(&self.clock),
                Arc::clone(&self.tracking),
                fresh.clone(),
                source.clone(),
            )
            .boxed()
            .shared();
            for id in fresh {
                tracking.fetching.insert(id, batch.clone());
            }
            attached.push(batch);
        }
        drop(tracking);

        async move {
            let batches = future::join_all(attached).await;
            let mut outcome = FetchOutcome::default();
            let mut loaded = HashSet::new();
            for batch in batches {
                for file in &batch.loaded_files {
                    if requested.contains(&file.id) && loaded.insert(file.id.clone()) {
                        outcome.loaded_files.push(file.clone());
                    }
                }
                outcome.errored_files.extend(
                    batch
                        .errored_files
                        .iter()
                        .filter(|id| requested.contains(*id))
                        .cloned(),
                );
            }
            outcome
        }
        .boxed()
    }

    /// Write the bytes of assets referenced by live image elements.
    ///
    /// Assets already saved, being saved or being fetched are skipped.
    /// Errored assets are retried. Assets referenced only by deleted
    /// elements are not written.
    pub async fn save_files(
        &self,
        elements: &[Arc<Element>],
        files: &HashMap<FileId, Arc<BinaryFile>>,
    ) -> SaveFilesOutcome {
        let referenced: HashSet<&FileId> = referenced_files(elements).collect();

        let to_save: Vec<Arc<BinaryFile>> = {
            let mut tracking = lock(&self.tracking);
            let pending: Vec<Arc<BinaryFile>> = files
                .values()
                .filter(|file| referenced.contains(&file.id))
                .filter(|file| !file.data.is_empty())
                .filter(|file| {
                    !tracking.saved.contains(&file.id)
                        && !tracking.saving.contains(&file.id)
                        && !tracking.fetching.contains_key(&file.id)
                })
                .cloned()
                .collect();
            for file in &pending {
                tracking.saving.insert(file.id.clone());
            }
            pending
        };

        let mut outcome = SaveFilesOutcome::default();
        if to_save.is_empty() {
            return outcome;
        }

        let now = self.clock.now_ms();
        for file in to_save {
            let result = self.storage.set(&keys::file(&file.id), encode_cached(&file, now)).await;
            let mut tracking = lock(&self.tracking);
            tracking.saving.remove(&file.id);
            match result {
                Ok(()) => {
                    tracking.errored.remove(&file.id);
                    tracking.saved.insert(file.id.clone());
                    outcome.saved_files.push(file.id.clone());
                }
                Err(e) => {
                    warn!("Failed to cache file {}: {}", file.id, e);
                    tracking.errored.insert(file.id.clone());
                    outcome.errored_files.push(file.id.clone());
                }
            }
        }

        outcome.saved_files.sort();
        outcome.errored_files.sort();
        debug!(
            "Saved {} files ({} errored)",
            outcome.saved_files.len(),
            outcome.errored_files.len()
        );
        outcome
    }

    /// Pending image whose asset is now saved: upgrade it to `saved`.
    pub fn should_update_image_status(&self, element: &Element) -> bool {
        match (&element.file_id, element.status) {
            (Some(file_id), Some(ImageStatus::Pending)) if !element.is_deleted => {
                lock(&self.tracking).saved.contains(file_id)
            }
            _ => false,
        }
    }

    /// Upgrade every pending image whose asset is saved. This is the only
    /// status change that bumps the element version.
    pub fn upgrade_saved_images(&self, elements: &[Arc<Element>]) -> Option<Vec<Arc<Element>>> {
        let mut changed = false;
        let next = elements
            .iter()
            .map(|element| {
                if self.should_update_image_status(element) {
                    changed = true;
                    Arc::new(element.mutated(|e| e.status = Some(ImageStatus::Saved)))
                } else {
                    Arc::clone(element)
                }
            })
            .collect();
        changed.then_some(next)
    }

    /// Asset bytes referenced by `elements` are being written right now.
    pub fn has_saves_in_flight(&self, elements: &[Arc<Element>]) -> bool {
        let tracking = lock(&self.tracking);
        referenced_files(elements).any(|id| tracking.saving.contains(id))
    }

    /// Closing now would lose asset bytes: a live image references an asset
    /// that is still being written, or whose bytes are held in `files` but
    /// never reached the cache (including failed writes).
    pub fn should_prevent_unload(
        &self,
        elements: &[Arc<Element>],
        files: &HashMap<FileId, Arc<BinaryFile>>,
    ) -> bool {
        let tracking = lock(&self.tracking);
        referenced_files(elements).any(|id| {
            tracking.saving.contains(id)
                || files
                    .get(id)
                    .is_some_and(|file| !file.data.is_empty() && !tracking.saved.contains(id))
        })
    }

    /// Delete cached assets that are neither in `current` nor retrieved
    /// within `OBSOLETE_FILE_TTL_MS`. Runs at most once per session.
    pub async fn clear_obsolete(&self, current: &HashSet<FileId>) -> Result<usize> {
        if self.obsolete_cleared.swap(true, Ordering::SeqCst) {
            warn!("clear_obsolete already ran for this session, ignoring");
            return Ok(0);
        }

        let now = self.clock.now_ms();
        let mut removed = 0;
        for key in self.storage.keys(keys::FILES_PREFIX).await? {
            let Some(id) = keys::file_id(&key) else {
                continue;
            };
            if current.contains(&id) {
                continue;
            }
            let expired = match self.storage.get(&key).await? {
                Some(bytes) => match decode_cached(&bytes) {
                    Some(file) => {
                        let last_used = file.last_retrieved.unwrap_or(file.created);
                        now.saturating_sub(last_used) >= OBSOLETE_FILE_TTL_MS
                    }
                    None => true,
                },
                None => false,
            };
            if expired {
                self.storage.delete(&key).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Cleared {} obsolete cached files", removed);
        }
        Ok(removed)
    }
}

/// File ids referenced by live, initialized image elements.
fn referenced_files(elements: &[Arc<Element>]) -> impl Iterator<Item = &FileId> {
    elements
        .iter()
        .filter(|element| !element.is_deleted)
        .filter_map(|element| element.file_id.as_ref())
}

/// Flag image elements whose asset failed to load.
///
/// Bookkeeping only: the version is not bumped, so peers never see the
/// local failure as an edit. Returns `None` when nothing changed.
pub fn update_stale_image_statuses(
    errored: &HashSet<FileId>,
    elements: &[Arc<Element>],
) -> Option<Vec<Arc<Element>>> {
    let mut changed = false;
    let next = elements
        .iter()
        .map(|element| match &element.file_id {
            Some(file_id)
                if errored.contains(file_id) && element.status != Some(ImageStatus::Error) =>
            {
                changed = true;
                let mut flagged = Element::clone(element);
                flagged.status = Some(ImageStatus::Error);
                Arc::new(flagged)
            }
            _ => Arc::clone(element),
        })
        .collect();
    changed.then_some(next)
}

async fn fetch_batch(
    storage: Arc<dyn Storage>,
    remote: Option<Arc<dyn RemoteFileSource>>,
    clock: Arc<dyn Clock>,
    tracking: Arc<Mutex<FileTracking>>,
    ids: Vec<FileId>,
    source: FileSource,
) -> Arc<FetchOutcome> {
    let now = clock.now_ms();
    let mut outcome = FetchOutcome::default();
    let mut missing = Vec::new();

    for id in &ids {
        match read_cached(storage.as_ref(), id, now).await {
            Some(file) => outcome.loaded_files.push(file),
            None => missing.push(id.clone()),
        }
    }

    if !missing.is_empty() {
        match (&source, &remote) {
            (FileSource::Remote { container, access_key }, Some(remote)) => {
                match remote.fetch_files(container, access_key, &missing).await {
                    Ok(fetched) => {
                        let wanted: HashSet<&FileId> = missing.iter().collect();
                        let mut returned = HashSet::new();
                        for mut file in fetched.loaded_files {
                            if !wanted.contains(&file.id) || !returned.insert(file.id.clone()) {
                                continue;
                            }
                            if let Err(e) = storage.set(&keys::file(&file.id), encode_cached(&file, now)).await {
                                warn!("Failed to cache fetched file {}: {}", file.id, e);
                            }
                            file.last_retrieved = Some(now);
                            file.status = FileStatus::Saved;
                            outcome.loaded_files.push(file);
                        }
                        outcome
                            .errored_files
                            .extend(missing.into_iter().filter(|id| !returned.contains(id)));
                    }
                    Err(e) => {
                        warn!("Remote fetch from {} failed: {}", container, e);
                        outcome.errored_files.extend(missing);
                    }
                }
            }
            _ => {
                debug!("{} files not in local cache", missing.len());
                outcome.errored_files.extend(missing);
            }
        }
    }

    let mut tracking = lock(&tracking);
    for id in &ids {
        tracking.fetching.remove(id);
    }
    for file in &outcome.loaded_files {
        tracking.errored.remove(&file.id);
        tracking.saved.insert(file.id.clone());
    }
    for id in &outcome.errored_files {
        tracking.errored.insert(id.clone());
    }

    Arc::new(outcome)
}

/// Read a cached asset and refresh its `lastRetrieved` stamp.
async fn read_cached(storage: &dyn Storage, id: &FileId, now: u64) -> Option<BinaryFile> {
    let key = keys::file(id);
    let bytes = match storage.get(&key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!("Failed to read cached file {}: {}", id, e);
            return None;
        }
    };
    let Some(mut file) = decode_cached(&bytes) else {
        warn!("Corrupt cached file {}, ignoring", id);
        return None;
    };

    if let Err(e) = storage.set(&key, encode_cached(&file, now)).await {
        debug!("Could not refresh lastRetrieved for {}: {}", id, e);
    }
    file.last_retrieved = Some(now);
    Some(file)
}
