//! Cross-replica staleness checks.
//!
//! Sibling replicas (tabs, processes) share durable storage but never talk to
//! each other. Each one periodically compares the version record it last
//! observed with the one in storage and pulls in whatever is newer:
//! - `elements`: reconciled into the in-memory scene
//! - `appState`: adopted as-is
//! - `files`: missing assets loaded from the local cache; images whose
//!   asset is not there either are flagged as broken
//! - `library`: adopted as-is
//!
//! Checks run on a fixed period and, debounced, when the replica regains
//! focus or visibility. The session skips them while collaborating live,
//! where peers deliver updates directly.

use crate::app_state::AppStateSubset;
use crate::config::SessionConfig;
use crate::debounce::{Debouncer, Ticker};
use crate::events::{Anomaly, ChangeOrigin, EventBus, SceneEvent};
use crate::files::{FileManager, FileSource};
use crate::library::LibraryItem;
use crate::persistence::{LocalData, Result};
use crate::reconcile::{ReconcileContext, reconcile_detailed};
use crate::store::SceneStore;
use crate::versions::StateKey;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scheduling state of the staleness check.
#[derive(Debug)]
pub struct TabSync {
    requested: Debouncer<()>,
    periodic: Ticker,
}

impl TabSync {
    pub fn new(config: &SessionConfig, now_ms: u64) -> Self {
        Self {
            requested: Debouncer::new(config.tab_sync_debounce()),
            periodic: Ticker::new(config.stale_check_interval(), now_ms),
        }
    }

    /// Ask for a check soon (focus, visibility regained, storage event).
    pub fn request_check(&mut self, now_ms: u64) {
        self.requested.schedule((), now_ms);
    }

    /// True when a check should run now. Consumes the trigger.
    pub fn take_due(&mut self, now_ms: u64) -> bool {
        let requested = self.requested.take_due(now_ms).is_some();
        let periodic = self.periodic.poll(now_ms);
        if requested {
            self.periodic.reset(now_ms);
        }
        requested || periodic
    }

    /// Drop any requested check (collaboration started).
    pub fn cancel(&mut self) {
        self.requested.cancel();
    }
}

/// What one staleness check pulled in.
#[derive(Debug, Default)]
pub struct StaleImport {
    pub keys: Vec<StateKey>,
    pub elements_updated: bool,
    /// Stored app state, when it was newer than the one held.
    pub app_state: Option<AppStateSubset>,
    /// Stored library, when it was newer than the one held.
    pub library: Option<Vec<LibraryItem>>,
    pub loaded_files: usize,
    pub errored_files: usize,
}

impl StaleImport {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Compare the known version record with storage and import newer state.
pub async fn import_stale_state(
    data: &LocalData,
    store: &Arc<SceneStore>,
    files: &FileManager,
    events: &EventBus,
    ctx: &ReconcileContext,
) -> Result<StaleImport> {
    let stored = data.stored_versions().await?;
    let stale = data.known_versions().stale_keys(&stored);
    let mut import = StaleImport::default();
    if stale.is_empty() {
        return Ok(import);
    }
    debug!("Storage newer for {:?}", stale);

    for key in stale {
        match key {
            StateKey::Elements => {
                let theirs = data.read_elements().await?;
                let mut duplicates = 0;
                import.elements_updated = store.update_elements(ChangeOrigin::Storage, |current| {
                    let merged = reconcile_detailed(current, &theirs, ctx);
                    duplicates = merged.duplicate_ids;
                    Some(merged.elements)
                });
                if duplicates > 0 {
                    warn!("Stored elements merged with {} duplicate ids", duplicates);
                    events.notice(
                        Anomaly::MergeAnomaly,
                        format!("{} duplicate element id(s) in stored scene", duplicates),
                    );
                }
            }
            StateKey::AppState => {
                import.app_state = data.read_app_state().await?;
            }
            StateKey::Files => {
                // Same path as a fresh load: loaded assets land in the store,
                // images of assets the cache lacks are flagged.
                if let Some(task) = files.resolve_missing(&store.elements(), store, &FileSource::Local) {
                    let outcome = task.await;
                    import.loaded_files = outcome.loaded_files.len();
                    import.errored_files = outcome.errored_files.len();
                }
            }
            StateKey::Library => {
                import.library = Some(data.read_library().await?);
            }
        }

        data.observe(key, stored.get(key));
        events.emit(SceneEvent::StaleStateImported {
            key: key.as_str().to_string(),
        });
        import.keys.push(key);
    }

    info!(
        "Imported newer state from storage: {:?} ({} files, {} errored)",
        import.keys, import.loaded_files, import.errored_files
    );
    Ok(import)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::element::{Element, FileId, ImageStatus};
    use crate::files::BinaryFile;
    use crate::persistence::SceneSnapshot;
    use crate::storage::{InMemoryStorage, keys};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct Replica {
        data: LocalData,
        files: Arc<FileManager>,
        store: Arc<SceneStore>,
        events: Arc<EventBus>,
    }

    fn replica(storage: &Arc<InMemoryStorage>) -> Replica {
        let clock = Arc::new(ManualClock::new(1_000));
        let events = Arc::new(EventBus::new());
        let files = Arc::new(FileManager::new(
            storage.clone(),
            None,
            clock.clone(),
            Arc::clone(&events),
        ));
        let data = LocalData::new(
            storage.clone(),
            Arc::clone(&files),
            clock,
            Arc::clone(&events),
            Duration::from_millis(300),
        );
        Replica {
            data,
            files,
            store: Arc::new(SceneStore::new(Arc::clone(&events))),
            events,
        }
    }

    async fn check(r: &Replica) -> StaleImport {
        import_stale_state(&r.data, &r.store, &r.files, &r.events, &ReconcileContext::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_requested_check_is_debounced_and_resets_period() {
        let mut sync = TabSync::new(&SessionConfig::default(), 0);

        sync.request_check(1_000);
        sync.request_check(1_030);
        assert!(!sync.take_due(1_060));
        assert!(sync.take_due(1_080));
        assert!(!sync.take_due(1_090));

        assert!(!sync.take_due(5_000));
        assert!(sync.take_due(6_080));
    }

    #[tokio::test]
    async fn test_imports_newer_elements_once() {
        let storage = Arc::new(InMemoryStorage::new());
        let writer = replica(&storage);
        let reader = replica(&storage);
        reader
            .store
            .replace_elements(vec![Arc::new(Element::new("mine"))], ChangeOrigin::Local);

        writer.data.save(
            SceneSnapshot {
                elements: vec![Arc::new(Element::new("theirs"))],
                ..Default::default()
            },
            None,
        );
        writer.data.flush_save().await.unwrap();

        let keys = Arc::new(Mutex::new(Vec::new()));
        let keys_clone = Arc::clone(&keys);
        let _sub = reader.events.subscribe(move |event| {
            if let SceneEvent::StaleStateImported { key } = event {
                keys_clone.lock().unwrap().push(key.clone());
            }
        });

        let import = check(&reader).await;
        assert!(import.elements_updated);
        let ids: Vec<_> = reader.store.elements().iter().map(|e| e.id.to_string()).collect();
        assert_eq!(ids, vec!["mine", "theirs"]);
        assert!(keys.lock().unwrap().contains(&"elements".to_string()));

        assert!(check(&reader).await.is_empty());
    }

    #[tokio::test]
    async fn test_adopts_newer_app_state_and_loads_files() {
        let storage = Arc::new(InMemoryStorage::new());
        let writer = replica(&storage);
        let reader = replica(&storage);

        let file = BinaryFile::new(FileId::new("f1"), "image/png", vec![9], 0);
        let mut snapshot = SceneSnapshot {
            elements: vec![Arc::new(Element::image("img", FileId::new("f1")))],
            ..Default::default()
        };
        snapshot.app_state.theme = Some("dark".into());
        snapshot.files.insert(file.id.clone(), Arc::new(file));
        writer.data.save(snapshot, None);
        writer.data.flush_save().await.unwrap();

        let import = check(&reader).await;

        assert_eq!(import.keys, vec![StateKey::Elements, StateKey::AppState, StateKey::Files]);
        assert_eq!(import.app_state.unwrap().theme.as_deref(), Some("dark"));
        assert_eq!(import.loaded_files, 1);
        assert_eq!(reader.store.file(&FileId::new("f1")).unwrap().data, vec![9]);
    }

    #[tokio::test]
    async fn test_images_missing_from_cache_are_flagged() {
        let storage = Arc::new(InMemoryStorage::new());
        let reader = replica(&storage);
        let image = Arc::new(Element::image("img", FileId::new("uncached")));
        reader
            .store
            .replace_elements(vec![Arc::clone(&image)], ChangeOrigin::Local);
        storage.put_raw(keys::VERSION_DATA_STATE, br#"{"files":{"version":1,"timestamp":5}}"#);

        let import = check(&reader).await;

        assert_eq!(import.keys, vec![StateKey::Files]);
        assert_eq!(import.errored_files, 1);
        let flagged = reader.store.element("img").unwrap();
        assert_eq!(flagged.status, Some(ImageStatus::Error));
        assert_eq!(flagged.version, image.version);
    }

    #[tokio::test]
    async fn test_adopts_newer_library() {
        let storage = Arc::new(InMemoryStorage::new());
        let writer = replica(&storage);
        let reader = replica(&storage);

        writer
            .data
            .save_library(&[LibraryItem::new("item", 1)])
            .await
            .unwrap();

        let import = check(&reader).await;
        assert_eq!(import.keys, vec![StateKey::Library]);
        assert_eq!(import.library.unwrap()[0].id, "item");
        assert!(check(&reader).await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_stored_ids_raise_notice() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.put_raw(
            keys::ELEMENTS,
            br#"[{"id":"a","version":1,"versionNonce":1},{"id":"a","version":2,"versionNonce":1}]"#,
        );
        storage.put_raw(keys::VERSION_DATA_STATE, br#"{"elements":{"version":1,"timestamp":1}}"#);
        let reader = replica(&storage);
        let notices = Arc::new(Mutex::new(Vec::new()));
        let notices_clone = Arc::clone(&notices);
        let _sub = reader.events.subscribe(move |event| {
            if let SceneEvent::Notice { anomaly, .. } = event {
                notices_clone.lock().unwrap().push(*anomaly);
            }
        });

        check(&reader).await;

        assert_eq!(*notices.lock().unwrap(), vec![Anomaly::MergeAnomaly]);
        let stored = reader.store.elements();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].version, 1);
    }
}
