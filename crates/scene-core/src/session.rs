//! SceneSession: one open document on one replica.
//!
//! The session owns the store, the file manager, the persistence manager and
//! the staleness monitor, and is the single entry point for host events.
//! It never spawns or sleeps itself: the host delivers `SessionEvent::Tick`
//! from its event loop and runs the futures handed back as
//! `SessionEffect::Spawn`.
//!
//! # Event flow
//!
//! ```text
//! LocalChange ──► store ──► broadcast (collab) ──► debounced save
//! PeerPayload ─┐
//! Import ──────┴► reconcile(store, remote) ──► resolve missing files
//! Focus / visible / StorageChanged ──► debounced staleness check
//! Blur / hidden / Unload ──► flush pending save
//! LibraryChanged ──► immediate library write
//! LocatorChanged ──► leave or join a room, merge the newly linked scene
//! Tick ──► due save, due or periodic staleness check
//! ```

use crate::app_state::AppStateSubset;
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::element::{Element, ElementId, FileId};
use crate::events::{Anomaly, ChangeOrigin, EventBus};
use crate::files::{
    BinaryFile, FetchError, FileManager, FileSource, FileStatus, RemoteFileSource, ResolveTask,
};
use crate::library::LibraryItem;
use crate::locator::SceneLocator;
use crate::payload::ScenePayload;
use crate::persistence::{LocalData, PersistenceError, SaveCallback, SaveReport, SceneSnapshot};
use crate::reconcile::{ReconcileContext, reconcile_detailed, reconcile_with};
use crate::replica::ReplicaId;
use crate::source::{RemoteSceneSource, SceneData};
use crate::storage::Storage;
use crate::store::SceneStore;
use crate::tab_sync::{TabSync, import_stale_state};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Session is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// External collaborators a session is wired to.
pub struct SessionHost {
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<EventBus>,
    pub remote_files: Option<Arc<dyn RemoteFileSource>>,
    pub remote_scenes: Option<Arc<dyn RemoteSceneSource>>,
}

impl SessionHost {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            events: Arc::new(EventBus::new()),
            remote_files: None,
            remote_scenes: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_remote_files(mut self, remote: Arc<dyn RemoteFileSource>) -> Self {
        self.remote_files = Some(remote);
        self
    }

    pub fn with_remote_scenes(mut self, remote: Arc<dyn RemoteSceneSource>) -> Self {
        self.remote_scenes = Some(remote);
        self
    }
}

/// A local edit as reported by the editor.
#[derive(Debug, Clone, Default)]
pub struct LocalChange {
    /// The full element collection after the edit, tombstones included.
    pub elements: Vec<Arc<Element>>,
    pub app_state: Option<AppStateSubset>,
    /// Assets inserted by this edit.
    pub files: Vec<BinaryFile>,
    /// Elements currently being dragged, resized or typed into.
    pub editing: HashSet<ElementId>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    LocalChange(LocalChange),
    PeerPayload(ScenePayload),
    /// A collaborator joined the room and needs the full scene.
    PeerJoined,
    /// Foreign collection from a file or URL.
    Import(Vec<Arc<Element>>),
    /// A sibling replica wrote to durable storage.
    StorageChanged,
    /// The user edited the library.
    LibraryChanged(Vec<LibraryItem>),
    /// The scene link changed while the session is open.
    LocatorChanged(SceneLocator),
    Focus,
    Blur,
    VisibilityChanged { hidden: bool },
    Unload,
    BeforeUnload,
    Tick,
}

/// Work the host must carry out on the session's behalf.
pub enum SessionEffect {
    /// Send to every collaboration peer.
    Broadcast(ScenePayload),
    /// Run to completion (spawn or await); results land in the store.
    Spawn(ResolveTask),
    /// Ask the user to confirm closing: asset bytes have not reached
    /// durable storage.
    PromptUnload,
}

impl fmt::Debug for SessionEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEffect::Broadcast(payload) => f
                .debug_tuple("Broadcast")
                .field(&payload.elements.len())
                .finish(),
            SessionEffect::Spawn(_) => f.write_str("Spawn(..)"),
            SessionEffect::PromptUnload => f.write_str("PromptUnload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadDecision {
    Allow,
    Prompt,
}

pub struct SceneSession {
    replica: ReplicaId,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    store: Arc<SceneStore>,
    files: Arc<FileManager>,
    data: Arc<LocalData>,
    remote_scenes: Option<Arc<dyn RemoteSceneSource>>,
    tab_sync: TabSync,
    locator: SceneLocator,
    file_source: FileSource,
    app_state: AppStateSubset,
    library: Vec<LibraryItem>,
    /// The last library write failed; retried on the next tick.
    library_unsaved: bool,
    editing: ReconcileContext,
    /// Precedence of each element as last sent to or received from peers.
    broadcast: HashMap<ElementId, (u64, u32)>,
    hidden: bool,
    closed: bool,
}

impl SceneSession {
    /// Load local state, merge the scene named by `locator` and resolve the
    /// assets it references.
    pub async fn open(
        replica: ReplicaId,
        config: SessionConfig,
        locator: SceneLocator,
        host: SessionHost,
    ) -> Result<Self> {
        let SessionHost {
            storage,
            clock,
            events,
            remote_files,
            remote_scenes,
        } = host;

        let store = Arc::new(SceneStore::new(Arc::clone(&events)));
        let files = Arc::new(FileManager::new(
            Arc::clone(&storage),
            remote_files,
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        let data = Arc::new(LocalData::new(
            storage,
            Arc::clone(&files),
            Arc::clone(&clock),
            Arc::clone(&events),
            config.save_debounce(),
        ));

        let loaded = data.load().await?;
        let mut elements = loaded.elements;
        let mut app_state = loaded.app_state.unwrap_or_default();

        if let Some(result) = load_external(&locator, remote_scenes.as_deref()).await {
            match result {
                Ok(scene) => {
                    debug!("[{}] Merging {} external elements", replica, scene.elements.len());
                    let merged = reconcile_detailed(&elements, &scene.elements, &ReconcileContext::default());
                    notice_duplicates(&events, replica, merged.duplicate_ids);
                    elements = merged.elements;
                    if let Some(scene_state) = &scene.app_state {
                        app_state.overlay(scene_state);
                    }
                }
                Err(e) => {
                    warn!("[{}] Failed to load {:?}: {}", replica, locator, e);
                    events.notice(Anomaly::FetchFailure, e.to_string());
                }
            }
        }

        let file_source = file_source_for(&locator);
        if locator.is_collaborative() {
            // Room state lives with the peers; local storage keeps the last
            // solo scene.
            data.pause_save();
        }

        store.replace_elements(elements, ChangeOrigin::Load);
        if let Some(task) = files.resolve_missing(&store.elements(), &store, &file_source) {
            task.await;
        }
        if locator == SceneLocator::Local {
            let current: HashSet<FileId> = store
                .elements()
                .iter()
                .filter_map(|element| element.file_id.clone())
                .collect();
            if let Err(e) = files.clear_obsolete(&current).await {
                warn!("[{}] Failed to clear obsolete files: {}", replica, e);
            }
        }

        let now = clock.now_ms();
        info!(
            "[{}] Opened scene session ({:?}, {} elements)",
            replica,
            locator,
            store.elements().len()
        );

        let mut session = Self {
            replica,
            config,
            clock,
            events,
            store,
            files,
            data,
            remote_scenes,
            tab_sync: TabSync::new(&config, now),
            locator,
            file_source,
            app_state,
            library: loaded.library,
            library_unsaved: false,
            editing: ReconcileContext::default(),
            broadcast: HashMap::new(),
            hidden: false,
            closed: false,
        };
        if session.is_collaborating() {
            session.mark_broadcast(&session.store.elements());
        }
        Ok(session)
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SceneStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn local_data(&self) -> &Arc<LocalData> {
        &self.data
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.files
    }

    pub fn locator(&self) -> &SceneLocator {
        &self.locator
    }

    pub fn app_state(&self) -> &AppStateSubset {
        &self.app_state
    }

    pub fn library(&self) -> &[LibraryItem] {
        &self.library
    }

    pub fn is_collaborating(&self) -> bool {
        self.locator.is_collaborative()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Dispatch one host event.
    pub async fn handle(&mut self, event: SessionEvent) -> Result<Vec<SessionEffect>> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let now = self.clock.now_ms();
        let mut effects = Vec::new();

        match event {
            SessionEvent::LocalChange(change) => {
                self.editing = ReconcileContext {
                    editing: change.editing,
                };
                if let Some(app_state) = change.app_state {
                    self.app_state = app_state;
                }
                if !change.files.is_empty() {
                    self.store.add_files(change.files);
                }
                self.store.replace_elements(change.elements, ChangeOrigin::Local);
                self.collect_broadcast(&mut effects);
                self.schedule_save();
            }
            SessionEvent::PeerPayload(payload) => {
                if payload.replica == self.replica {
                    debug!("[{}] Ignoring own payload", self.replica);
                } else {
                    debug!(
                        "[{}] Merging {} elements from {}",
                        self.replica,
                        payload.elements.len(),
                        payload.replica
                    );
                    self.merge_remote(&payload.elements, ChangeOrigin::Peer, &mut effects);
                    self.mark_received(&payload.elements);
                    self.schedule_save();
                }
            }
            SessionEvent::PeerJoined => {
                if self.is_collaborating() {
                    let elements = self.store.elements().to_vec();
                    self.mark_broadcast(&elements);
                    effects.push(SessionEffect::Broadcast(ScenePayload::init(
                        self.replica,
                        now,
                        elements,
                    )));
                }
            }
            SessionEvent::Import(elements) => {
                info!("[{}] Importing {} elements", self.replica, elements.len());
                self.merge_remote(&elements, ChangeOrigin::Import, &mut effects);
                self.collect_broadcast(&mut effects);
                self.schedule_save();
            }
            SessionEvent::StorageChanged | SessionEvent::Focus => {
                self.request_check(now);
            }
            SessionEvent::LibraryChanged(items) => {
                self.library = items;
                self.persist_library().await;
            }
            SessionEvent::LocatorChanged(locator) => {
                self.change_locator(locator, &mut effects).await?;
            }
            SessionEvent::VisibilityChanged { hidden } => {
                self.hidden = hidden;
                if hidden {
                    self.flush(&mut effects).await?;
                } else {
                    self.request_check(now);
                }
            }
            SessionEvent::Blur | SessionEvent::Unload => {
                self.flush(&mut effects).await?;
            }
            SessionEvent::BeforeUnload => {
                if self.before_unload(&mut effects).await? == UnloadDecision::Prompt {
                    effects.push(SessionEffect::PromptUnload);
                }
            }
            SessionEvent::Tick => {
                self.tick(now, &mut effects).await;
            }
        }

        Ok(effects)
    }

    /// Flush pending work and stop accepting events.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut effects = Vec::new();
        self.flush(&mut effects).await?;
        // The flush may have upgraded image statuses and queued one more save.
        if self.data.has_pending_save() {
            self.data.flush_save().await?;
        }
        self.closed = true;
        info!("[{}] Closed scene session", self.replica);
        Ok(())
    }

    /// Earliest time at which `Tick` has work to do (pending save).
    pub fn next_save_due(&self) -> Option<u64> {
        self.data.save_due_at()
    }

    fn request_check(&mut self, now: u64) {
        if !self.is_collaborating() {
            self.tab_sync.request_check(now);
        }
    }

    fn merge_remote(&mut self, remote: &[Arc<Element>], origin: ChangeOrigin, effects: &mut Vec<SessionEffect>) {
        let ctx = &self.editing;
        let mut duplicates = 0;
        self.store.update_elements(origin, |current| {
            let merged = reconcile_detailed(current, remote, ctx);
            duplicates = merged.duplicate_ids;
            Some(merged.elements)
        });
        notice_duplicates(&self.events, self.replica, duplicates);
        self.resolve_files(effects);
    }

    /// Write the library; a failure is kept for the next tick.
    async fn persist_library(&mut self) {
        match self.data.save_library(&self.library).await {
            Ok(_) => self.library_unsaved = false,
            Err(e) => {
                warn!("[{}] Library save failed: {}", self.replica, e);
                self.library_unsaved = true;
            }
        }
    }

    /// Re-initialize for a new scene link: leave the room if the new link is
    /// not one, pause local saving when joining one, then merge the linked
    /// scene and resolve its assets.
    async fn change_locator(&mut self, locator: SceneLocator, effects: &mut Vec<SessionEffect>) -> Result<()> {
        if locator == self.locator {
            return Ok(());
        }
        info!("[{}] Scene link changed: {:?} -> {:?}", self.replica, self.locator, locator);

        let was_collaborating = self.is_collaborating();
        if was_collaborating {
            self.stop_collaboration().await?;
        }
        if locator.is_collaborative() {
            if !was_collaborating {
                // The solo scene stays in local storage while in the room.
                self.flush(effects).await?;
            }
            self.data.cancel_save();
            self.data.pause_save();
            self.tab_sync.cancel();
        }
        self.broadcast.clear();
        self.file_source = file_source_for(&locator);
        self.locator = locator;

        let external = load_external(&self.locator, self.remote_scenes.as_deref()).await;
        match external {
            Some(Ok(scene)) => {
                if let Some(scene_state) = &scene.app_state {
                    self.app_state.overlay(scene_state);
                }
                self.merge_remote(&scene.elements, ChangeOrigin::Load, effects);
                self.schedule_save();
            }
            Some(Err(e)) => {
                warn!("[{}] Failed to load {:?}: {}", self.replica, self.locator, e);
                self.events.notice(Anomaly::FetchFailure, e.to_string());
                self.resolve_files(effects);
            }
            None => self.resolve_files(effects),
        }

        if self.is_collaborating() {
            let elements = self.store.elements();
            self.mark_broadcast(&elements);
        }
        Ok(())
    }

    /// Leave the room: the solo scene in local storage becomes current again.
    async fn stop_collaboration(&mut self) -> Result<()> {
        info!("[{}] Leaving collaboration room", self.replica);
        self.data.resume_save();
        let loaded = self.data.load().await?;
        self.app_state = loaded.app_state.unwrap_or_default();
        self.library = loaded.library;
        self.editing = ReconcileContext::default();
        self.store.replace_elements(loaded.elements, ChangeOrigin::Load);
        Ok(())
    }

    fn resolve_files(&self, effects: &mut Vec<SessionEffect>) {
        if let Some(task) = self
            .files
            .resolve_missing(&self.store.elements(), &self.store, &self.file_source)
        {
            effects.push(SessionEffect::Spawn(task));
        }
    }

    /// Queue a broadcast of elements changed since the last exchange.
    fn collect_broadcast(&mut self, effects: &mut Vec<SessionEffect>) {
        if !self.is_collaborating() {
            return;
        }
        let changed: Vec<Arc<Element>> = self
            .store
            .elements()
            .iter()
            .filter(|element| self.broadcast.get(&element.id) != Some(&element.precedence()))
            .cloned()
            .collect();
        if changed.is_empty() {
            return;
        }
        self.mark_broadcast(&changed);
        debug!("[{}] Broadcasting {} elements", self.replica, changed.len());
        effects.push(SessionEffect::Broadcast(ScenePayload::update(
            self.replica,
            self.clock.now_ms(),
            changed,
        )));
    }

    fn mark_broadcast(&mut self, elements: &[Arc<Element>]) {
        for element in elements {
            self.broadcast.insert(element.id.clone(), element.precedence());
        }
    }

    /// Peers already hold what they sent us; do not echo it back.
    fn mark_received(&mut self, elements: &[Arc<Element>]) {
        for element in elements {
            if let Some(held) = self.store.element(element.id.as_str()) {
                if held.precedence() == element.precedence() {
                    self.broadcast.insert(element.id.clone(), element.precedence());
                }
            }
        }
    }

    fn schedule_save(&self) {
        if self.data.is_save_paused() {
            return;
        }
        let snapshot = SceneSnapshot {
            elements: self.store.elements().to_vec(),
            app_state: self.app_state.clone(),
            files: self.store.files(),
        };
        self.data.save(snapshot, Some(self.save_callback()));
    }

    /// Applied once the coalesced write lands.
    fn save_callback(&self) -> SaveCallback {
        let store = Arc::clone(&self.store);
        let files = Arc::clone(&self.files);
        let ctx = self.editing.clone();
        Box::new(move |report: &SaveReport| {
            if let Some(merged) = &report.merged {
                store.update_elements(ChangeOrigin::Storage, |current| {
                    Some(reconcile_with(current, merged, &ctx))
                });
            }
            for id in &report.files.saved_files {
                store.set_file_status(id, FileStatus::Saved);
            }
            store.update_elements(ChangeOrigin::Status, |current| files.upgrade_saved_images(current));
        })
    }

    /// Bookkeeping after a write: the save callback may have changed the
    /// store, which peers and the next write need to see.
    fn after_write(&mut self, before: &Arc<[Arc<Element>]>, effects: &mut Vec<SessionEffect>) {
        if !Arc::ptr_eq(before, &self.store.elements()) {
            self.collect_broadcast(effects);
            self.schedule_save();
        }
    }

    async fn flush(&mut self, effects: &mut Vec<SessionEffect>) -> Result<()> {
        let before = self.store.elements();
        if self.data.flush_save().await?.is_some() {
            self.after_write(&before, effects);
        }
        Ok(())
    }

    async fn before_unload(&mut self, effects: &mut Vec<SessionEffect>) -> Result<UnloadDecision> {
        self.flush(effects).await?;
        let visible: Vec<Arc<Element>> = self.store.visible_elements().collect();
        if self.data.should_prevent_unload(&visible, &self.store.files()) {
            warn!("[{}] Unsaved files would be lost on unload", self.replica);
            self.events
                .notice(Anomaly::UnloadDataLoss, "files have not been saved");
            return Ok(UnloadDecision::Prompt);
        }
        Ok(UnloadDecision::Allow)
    }

    /// Failures are logged and contained so one failing step does not
    /// starve the others.
    async fn tick(&mut self, now: u64, effects: &mut Vec<SessionEffect>) {
        let before = self.store.elements();
        match self.data.tick().await {
            Ok(Some(_)) => self.after_write(&before, effects),
            Ok(None) => {}
            Err(e) => warn!("[{}] Save failed: {}", self.replica, e),
        }
        if self.library_unsaved {
            self.persist_library().await;
        }

        let due = self.tab_sync.take_due(now);
        if !due || self.is_collaborating() || self.hidden {
            return;
        }
        match import_stale_state(&self.data, &self.store, &self.files, &self.events, &self.editing).await {
            Ok(import) => {
                if let Some(app_state) = import.app_state {
                    self.app_state = app_state;
                }
                // An unsaved local edit outranks the stored library once written.
                if let Some(library) = import.library.filter(|_| !self.library_unsaved) {
                    self.library = library;
                }
                if import.elements_updated {
                    self.resolve_files(effects);
                }
            }
            Err(e) => warn!("[{}] Staleness check failed: {}", self.replica, e),
        }
    }
}

fn file_source_for(locator: &SceneLocator) -> FileSource {
    match locator.file_container() {
        Some((container, access_key)) => FileSource::Remote {
            container,
            access_key,
        },
        None => FileSource::Local,
    }
}

fn notice_duplicates(events: &EventBus, replica: ReplicaId, duplicates: usize) {
    if duplicates == 0 {
        return;
    }
    warn!("[{}] Merge input carried {} duplicate element ids", replica, duplicates);
    events.notice(
        Anomaly::MergeAnomaly,
        format!("{} duplicate element id(s) ignored", duplicates),
    );
}

async fn load_external(
    locator: &SceneLocator,
    remote: Option<&dyn RemoteSceneSource>,
) -> Option<std::result::Result<SceneData, FetchError>> {
    if *locator == SceneLocator::Local {
        return None;
    }
    let Some(remote) = remote else {
        return Some(Err(FetchError::Remote("no remote scene source configured".into())));
    };
    Some(match locator {
        SceneLocator::ShareLink { id, key } => remote.load_share_link(id, key).await,
        SceneLocator::CollabRoom { room_id, room_key } => remote.join_room(room_id, room_key).await,
        SceneLocator::ExternalUrl(url) => remote.load_url(url).await,
        SceneLocator::LegacyId(id) => remote.load_legacy(id).await,
        SceneLocator::Local => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::element::ImageStatus;
    use crate::events::SceneEvent;
    use crate::events::Subscription;
    use crate::files::FetchOutcome;
    use crate::storage::{InMemoryStorage, StorageError, keys};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Storage that can refuse asset writes or fail a number of batches.
    #[derive(Default)]
    struct FaultyStorage {
        inner: InMemoryStorage,
        reject_files: bool,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Storage for FaultyStorage {
        async fn get(&self, key: &str) -> crate::storage::Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> crate::storage::Result<()> {
            if self.reject_files && entries.iter().any(|(key, _)| key.starts_with(keys::FILES_PREFIX)) {
                return Err(StorageError::Io("quota exceeded".into()));
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Io("disk full".into()));
            }
            self.inner.write_batch(entries).await
        }

        async fn delete(&self, key: &str) -> crate::storage::Result<()> {
            self.inner.delete(key).await
        }

        async fn keys(&self, prefix: &str) -> crate::storage::Result<Vec<String>> {
            self.inner.keys(prefix).await
        }
    }

    struct FakeScenes {
        scene: Option<SceneData>,
    }

    #[async_trait]
    impl RemoteSceneSource for FakeScenes {
        async fn load_share_link(&self, _id: &str, _key: &str) -> crate::files::Result<SceneData> {
            self.scene
                .clone()
                .ok_or_else(|| FetchError::Remote("share link not found".into()))
        }

        async fn load_url(&self, _url: &str) -> crate::files::Result<SceneData> {
            self.load_share_link("", "").await
        }

        async fn join_room(&self, _room_id: &str, _room_key: &str) -> crate::files::Result<SceneData> {
            self.load_share_link("", "").await
        }
    }

    struct NoFiles;

    #[async_trait]
    impl RemoteFileSource for NoFiles {
        async fn fetch_files(&self, _c: &str, _k: &str, ids: &[FileId]) -> crate::files::Result<FetchOutcome> {
            Ok(FetchOutcome {
                loaded_files: Vec::new(),
                errored_files: ids.iter().cloned().collect(),
            })
        }
    }

    fn replica_id(n: u64) -> ReplicaId {
        ReplicaId::from(n)
    }

    fn host(storage: &Arc<InMemoryStorage>, clock: &Arc<ManualClock>) -> SessionHost {
        SessionHost::new(storage.clone(), clock.clone())
    }

    async fn open_local(storage: &Arc<InMemoryStorage>, clock: &Arc<ManualClock>, n: u64) -> SceneSession {
        SceneSession::open(replica_id(n), SessionConfig::default(), SceneLocator::Local, host(storage, clock))
            .await
            .unwrap()
    }

    fn change(elements: Vec<Arc<Element>>) -> SessionEvent {
        SessionEvent::LocalChange(LocalChange {
            elements,
            ..Default::default()
        })
    }

    fn record_notices(events: &Arc<EventBus>) -> (Arc<Mutex<Vec<Anomaly>>>, Subscription) {
        let notices = Arc::new(Mutex::new(Vec::new()));
        let notices_clone = Arc::clone(&notices);
        let sub = events.subscribe(move |event| {
            if let SceneEvent::Notice { anomaly, .. } = event {
                notices_clone.lock().unwrap().push(*anomaly);
            }
        });
        (notices, sub)
    }

    fn ids(session: &SceneSession) -> Vec<String> {
        session.store().elements().iter().map(|e| e.id.to_string()).collect()
    }

    fn broadcasts(effects: &[SessionEffect]) -> Vec<&ScenePayload> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                SessionEffect::Broadcast(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_local_change_saved_after_debounce() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut session = open_local(&storage, &clock, 1).await;

        session.handle(change(vec![Arc::new(Element::new("a"))])).await.unwrap();
        clock.advance(299);
        session.handle(SessionEvent::Tick).await.unwrap();
        assert_eq!(storage.batch_count(), 0);

        clock.advance(1);
        session.handle(SessionEvent::Tick).await.unwrap();
        assert_eq!(storage.batch_count(), 1);
        assert_eq!(session.local_data().read_elements().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blur_flushes_immediately() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut session = open_local(&storage, &clock, 1).await;

        session.handle(change(vec![Arc::new(Element::new("a"))])).await.unwrap();
        session.handle(SessionEvent::Blur).await.unwrap();
        assert_eq!(storage.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_payload_is_reconciled_not_replaced() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut session = open_local(&storage, &clock, 1).await;
        let e1 = Arc::new(Element::new("e1"));
        session
            .handle(change(vec![Arc::clone(&e1), Arc::new(Element::new("e2"))]))
            .await
            .unwrap();

        let moved = Arc::new(e1.mutated(|e| {
            e.attributes.insert("x".into(), 5.into());
        }));
        let payload = ScenePayload::update(replica_id(2), 0, vec![Arc::clone(&moved), Arc::new(Element::new("e3"))]);
        session.handle(SessionEvent::PeerPayload(payload)).await.unwrap();

        // e3 follows its remote predecessor e1
        assert_eq!(ids(&session), vec!["e1", "e3", "e2"]);
        assert_eq!(session.store().element("e1").unwrap().attributes["x"], 5);

        let own = ScenePayload::update(replica_id(1), 0, vec![Arc::new(Element::new("echo"))]);
        session.handle(SessionEvent::PeerPayload(own)).await.unwrap();
        assert_eq!(ids(&session), vec!["e1", "e3", "e2"]);
    }

    #[tokio::test]
    async fn test_import_merges_with_local_scene() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut session = open_local(&storage, &clock, 1).await;
        session.handle(change(vec![Arc::new(Element::new("mine"))])).await.unwrap();

        session
            .handle(SessionEvent::Import(vec![Arc::new(Element::new("imported"))]))
            .await
            .unwrap();
        assert_eq!(ids(&session), vec!["mine", "imported"]);
    }

    #[tokio::test]
    async fn test_focus_pulls_sibling_writes() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut first = open_local(&storage, &clock, 1).await;
        let mut second = open_local(&storage, &clock, 2).await;

        first.handle(change(vec![Arc::new(Element::new("from-first"))])).await.unwrap();
        first.handle(SessionEvent::Blur).await.unwrap();

        second.handle(SessionEvent::Focus).await.unwrap();
        clock.advance(50);
        second.handle(SessionEvent::Tick).await.unwrap();

        assert_eq!(ids(&second), vec!["from-first"]);
    }

    #[tokio::test]
    async fn test_hidden_replica_skips_staleness_check() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut first = open_local(&storage, &clock, 1).await;
        let mut second = open_local(&storage, &clock, 2).await;

        first.handle(change(vec![Arc::new(Element::new("a"))])).await.unwrap();
        first.handle(SessionEvent::Blur).await.unwrap();

        second
            .handle(SessionEvent::VisibilityChanged { hidden: true })
            .await
            .unwrap();
        clock.advance(10_000);
        second.handle(SessionEvent::Tick).await.unwrap();
        assert!(ids(&second).is_empty());
    }

    #[tokio::test]
    async fn test_saved_images_upgraded_after_write() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut session = open_local(&storage, &clock, 1).await;
        let image = Arc::new(Element::image("img", FileId::new("f1")));

        session
            .handle(SessionEvent::LocalChange(LocalChange {
                elements: vec![Arc::clone(&image)],
                files: vec![BinaryFile::new(FileId::new("f1"), "image/png", vec![1], 0)],
                ..Default::default()
            }))
            .await
            .unwrap();
        session.handle(SessionEvent::Blur).await.unwrap();

        let upgraded = session.store().element("img").unwrap();
        assert_eq!(upgraded.status, Some(ImageStatus::Saved));
        assert_eq!(upgraded.version, image.version + 1);
        assert_eq!(
            session.store().file(&FileId::new("f1")).unwrap().status,
            FileStatus::Saved
        );
        assert!(session.local_data().has_pending_save());

        session.close().await.unwrap();
        let stored = session.local_data().read_elements().await.unwrap();
        assert_eq!(stored[0].status, Some(ImageStatus::Saved));
    }

    #[tokio::test]
    async fn test_collab_broadcasts_only_changes() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let room_element = Arc::new(Element::new("shared"));
        let remote = Arc::new(FakeScenes {
            scene: Some(SceneData {
                elements: vec![Arc::clone(&room_element)],
                app_state: None,
            }),
        });
        let mut session = SceneSession::open(
            replica_id(1),
            SessionConfig::default(),
            SceneLocator::parse("#room=r1,key1"),
            host(&storage, &clock).with_remote_scenes(remote),
        )
        .await
        .unwrap();
        assert!(session.local_data().is_save_paused());

        let added = Arc::new(Element::new("new"));
        let effects = session
            .handle(change(vec![Arc::clone(&room_element), Arc::clone(&added)]))
            .await
            .unwrap();
        let sent = broadcasts(&effects);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].elements.len(), 1);
        assert_eq!(sent[0].elements[0].id.as_str(), "new");

        let effects = session.handle(SessionEvent::PeerJoined).await.unwrap();
        assert_eq!(broadcasts(&effects)[0].elements.len(), 2);

        clock.advance(1_000);
        session.handle(SessionEvent::Tick).await.unwrap();
        assert_eq!(storage.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_received_elements_not_echoed() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(FakeScenes {
            scene: Some(SceneData::default()),
        });
        let mut session = SceneSession::open(
            replica_id(1),
            SessionConfig::default(),
            SceneLocator::parse("#room=r1,key1"),
            host(&storage, &clock).with_remote_scenes(remote),
        )
        .await
        .unwrap();

        let theirs = Arc::new(Element::new("theirs"));
        let payload = ScenePayload::update(replica_id(2), 0, vec![Arc::clone(&theirs)]);
        session.handle(SessionEvent::PeerPayload(payload)).await.unwrap();

        let mine = Arc::new(Element::new("mine"));
        let effects = session
            .handle(change(vec![Arc::clone(&theirs), Arc::clone(&mine)]))
            .await
            .unwrap();
        let sent = broadcasts(&effects);
        assert_eq!(sent[0].elements.len(), 1);
        assert_eq!(sent[0].elements[0].id.as_str(), "mine");
    }

    #[tokio::test]
    async fn test_share_link_failure_keeps_local_scene() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        {
            let mut session = open_local(&storage, &clock, 1).await;
            session.handle(change(vec![Arc::new(Element::new("local"))])).await.unwrap();
            session.close().await.unwrap();
        }

        let events = Arc::new(EventBus::new());
        let notices = Arc::new(Mutex::new(Vec::new()));
        let notices_clone = Arc::clone(&notices);
        let _sub = events.subscribe(move |event| {
            if let SceneEvent::Notice { anomaly, .. } = event {
                notices_clone.lock().unwrap().push(*anomaly);
            }
        });

        let session = SceneSession::open(
            replica_id(2),
            SessionConfig::default(),
            SceneLocator::parse("#json=abc,key"),
            host(&storage, &clock)
                .with_events(events)
                .with_remote_scenes(Arc::new(FakeScenes { scene: None })),
        )
        .await
        .unwrap();

        assert_eq!(ids(&session), vec!["local"]);
        assert_eq!(*notices.lock().unwrap(), vec![Anomaly::FetchFailure]);
    }

    #[tokio::test]
    async fn test_share_link_images_fetched_from_container() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(FakeScenes {
            scene: Some(SceneData {
                elements: vec![Arc::new(Element::image("img", FileId::new("missing")))],
                app_state: None,
            }),
        });

        let session = SceneSession::open(
            replica_id(1),
            SessionConfig::default(),
            SceneLocator::parse("#json=abc,key"),
            host(&storage, &clock)
                .with_remote_scenes(remote)
                .with_remote_files(Arc::new(NoFiles)),
        )
        .await
        .unwrap();

        let element = session.store().element("img").unwrap();
        assert_eq!(element.status, Some(ImageStatus::Error));
    }

    #[tokio::test]
    async fn test_before_unload_allows_when_nothing_pending() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut session = open_local(&storage, &clock, 1).await;

        session.handle(change(vec![Arc::new(Element::new("a"))])).await.unwrap();
        let effects = session.handle(SessionEvent::BeforeUnload).await.unwrap();

        assert!(effects.iter().all(|e| !matches!(e, SessionEffect::PromptUnload)));
        assert_eq!(storage.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_before_unload_prompts_when_file_write_failed() {
        let storage = Arc::new(FaultyStorage {
            reject_files: true,
            ..Default::default()
        });
        let clock = Arc::new(ManualClock::new(0));
        let events = Arc::new(EventBus::new());
        let (notices, _sub) = record_notices(&events);
        let mut session = SceneSession::open(
            replica_id(1),
            SessionConfig::default(),
            SceneLocator::Local,
            SessionHost::new(storage.clone(), clock.clone()).with_events(events),
        )
        .await
        .unwrap();

        session
            .handle(SessionEvent::LocalChange(LocalChange {
                elements: vec![Arc::new(Element::image("img", FileId::new("f1")))],
                files: vec![BinaryFile::new(FileId::new("f1"), "image/png", vec![1], 0)],
                ..Default::default()
            }))
            .await
            .unwrap();
        let effects = session.handle(SessionEvent::BeforeUnload).await.unwrap();

        assert!(effects.iter().any(|e| matches!(e, SessionEffect::PromptUnload)));
        assert!(session.file_manager().is_errored(&FileId::new("f1")));
        assert_eq!(*notices.lock().unwrap(), vec![Anomaly::UnloadDataLoss]);
        // The scene itself was still written
        assert_eq!(session.local_data().read_elements().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_save_is_written_on_blur() {
        let storage = Arc::new(FaultyStorage {
            failures: AtomicUsize::new(1),
            ..Default::default()
        });
        let clock = Arc::new(ManualClock::new(0));
        let mut session = SceneSession::open(
            replica_id(1),
            SessionConfig::default(),
            SceneLocator::Local,
            SessionHost::new(storage.clone(), clock.clone()),
        )
        .await
        .unwrap();

        session.handle(change(vec![Arc::new(Element::new("a"))])).await.unwrap();
        clock.advance(300);
        session.handle(SessionEvent::Tick).await.unwrap();
        assert!(session.local_data().has_pending_save());
        assert!(session.local_data().read_elements().await.unwrap().is_empty());

        session.handle(SessionEvent::Blur).await.unwrap();
        let stored = session.local_data().read_elements().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_peer_payload_raise_notice() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let events = Arc::new(EventBus::new());
        let (notices, _sub) = record_notices(&events);
        let mut session = SceneSession::open(
            replica_id(1),
            SessionConfig::default(),
            SceneLocator::Local,
            host(&storage, &clock).with_events(events),
        )
        .await
        .unwrap();

        let payload = ScenePayload::update(
            replica_id(2),
            0,
            vec![Arc::new(Element::new("d")), Arc::new(Element::new("d"))],
        );
        session.handle(SessionEvent::PeerPayload(payload)).await.unwrap();

        assert_eq!(ids(&session), vec!["d"]);
        assert_eq!(*notices.lock().unwrap(), vec![Anomaly::MergeAnomaly]);
    }

    #[tokio::test]
    async fn test_library_edits_reach_siblings() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut first = open_local(&storage, &clock, 1).await;
        let mut second = open_local(&storage, &clock, 2).await;

        first
            .handle(SessionEvent::LibraryChanged(vec![LibraryItem::new("shapes", 1)]))
            .await
            .unwrap();

        second.handle(SessionEvent::Focus).await.unwrap();
        clock.advance(50);
        second.handle(SessionEvent::Tick).await.unwrap();
        assert_eq!(second.library()[0].id, "shapes");

        let third = open_local(&storage, &clock, 3).await;
        assert_eq!(third.library().len(), 1);
    }

    #[tokio::test]
    async fn test_locator_change_merges_linked_scene() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let remote = Arc::new(FakeScenes {
            scene: Some(SceneData {
                elements: vec![Arc::new(Element::new("shared"))],
                app_state: None,
            }),
        });
        let mut session = SceneSession::open(
            replica_id(1),
            SessionConfig::default(),
            SceneLocator::Local,
            host(&storage, &clock).with_remote_scenes(remote),
        )
        .await
        .unwrap();
        session.handle(change(vec![Arc::new(Element::new("mine"))])).await.unwrap();

        session
            .handle(SessionEvent::LocatorChanged(SceneLocator::parse("#json=abc,key")))
            .await
            .unwrap();

        assert_eq!(ids(&session), vec!["mine", "shared"]);
        assert!(matches!(session.locator(), SceneLocator::ShareLink { .. }));
        session.handle(SessionEvent::Blur).await.unwrap();
        assert_eq!(session.local_data().read_elements().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_leaving_room_restores_solo_scene() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        {
            let mut solo = open_local(&storage, &clock, 1).await;
            solo.handle(change(vec![Arc::new(Element::new("solo"))])).await.unwrap();
            solo.close().await.unwrap();
        }
        let remote = Arc::new(FakeScenes {
            scene: Some(SceneData {
                elements: vec![Arc::new(Element::new("room"))],
                app_state: None,
            }),
        });
        let mut session = SceneSession::open(
            replica_id(2),
            SessionConfig::default(),
            SceneLocator::Local,
            host(&storage, &clock).with_remote_scenes(remote),
        )
        .await
        .unwrap();

        session
            .handle(SessionEvent::LocatorChanged(SceneLocator::parse("#room=r1,key1")))
            .await
            .unwrap();
        assert!(session.is_collaborating());
        assert!(session.local_data().is_save_paused());
        assert_eq!(ids(&session), vec!["solo", "room"]);

        session
            .handle(SessionEvent::LocatorChanged(SceneLocator::Local))
            .await
            .unwrap();
        assert!(!session.is_collaborating());
        assert!(!session.local_data().is_save_paused());
        assert_eq!(ids(&session), vec!["solo"]);
        assert_eq!(storage.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_events() {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut session = open_local(&storage, &clock, 1).await;

        session.close().await.unwrap();
        assert!(matches!(
            session.handle(SessionEvent::Tick).await,
            Err(SessionError::Closed)
        ));
    }
}
