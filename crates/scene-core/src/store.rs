//! SceneStore: the authoritative in-memory scene of one replica.
//!
//! Elements are held as an immutable snapshot (`Arc<[Arc<Element>]>`) that
//! is swapped as a whole, so readers never observe a half-applied update.

use crate::element::{Element, FileId};
use crate::events::{ChangeOrigin, EventBus, SceneEvent};
use crate::files::{BinaryFile, FileStatus};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

pub struct SceneStore {
    elements: RwLock<Arc<[Arc<Element>]>>,
    files: RwLock<HashMap<FileId, Arc<BinaryFile>>>,
    events: Arc<EventBus>,
}

impl SceneStore {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            elements: RwLock::new(Arc::from(Vec::new())),
            files: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// All elements in paint order, tombstones included.
    pub fn elements(&self) -> Arc<[Arc<Element>]> {
        Arc::clone(&self.elements.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Non-deleted elements, derived from the current snapshot on each call.
    pub fn visible_elements(&self) -> impl Iterator<Item = Arc<Element>> + use<> {
        let snapshot = self.elements();
        (0..snapshot.len())
            .map(move |i| Arc::clone(&snapshot[i]))
            .filter(|element| !element.is_deleted)
    }

    pub fn element(&self, id: &str) -> Option<Arc<Element>> {
        self.elements()
            .iter()
            .find(|element| element.id.as_str() == id)
            .cloned()
    }

    /// Swap in a full collection. Returns false when nothing changed.
    pub fn replace_elements(&self, next: Vec<Arc<Element>>, origin: ChangeOrigin) -> bool {
        self.update_elements(origin, |_| Some(next))
    }

    /// Derive the next collection from the current one under the write lock.
    ///
    /// `update` returns `None` to leave the store untouched. Used for
    /// read-merge-write sequences that must not lose a concurrent replace.
    pub fn update_elements(
        &self,
        origin: ChangeOrigin,
        update: impl FnOnce(&[Arc<Element>]) -> Option<Vec<Arc<Element>>>,
    ) -> bool {
        let (total, visible) = {
            let mut current = self.elements.write().unwrap_or_else(|e| e.into_inner());
            let Some(next) = update(&current) else {
                return false;
            };
            if same_collection(&current, &next) {
                return false;
            }
            let visible = next.iter().filter(|e| !e.is_deleted).count();
            let total = next.len();
            *current = Arc::from(next);
            (total, visible)
        };

        debug!("Replaced elements ({:?}): {} total, {} visible", origin, total, visible);
        self.events.emit(SceneEvent::ElementsReplaced {
            origin,
            total,
            visible,
        });
        true
    }

    /// Merge assets into the file map.
    ///
    /// A `saved` asset is never replaced: late fetch results for it are
    /// discarded and it is never downgraded to `pending` or `error`.
    pub fn add_files(&self, incoming: impl IntoIterator<Item = BinaryFile>) -> usize {
        let added = {
            let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
            let mut added = 0;
            for file in incoming {
                if let Some(existing) = files.get(&file.id) {
                    if existing.status == FileStatus::Saved {
                        debug!("Ignoring update for already saved file {}", file.id);
                        continue;
                    }
                }
                files.insert(file.id.clone(), Arc::new(file));
                added += 1;
            }
            added
        };

        if added > 0 {
            self.events.emit(SceneEvent::FilesAdded { count: added });
        }
        added
    }

    /// Update the status of a held asset, honouring the no-downgrade rule.
    pub fn set_file_status(&self, id: &FileId, status: FileStatus) -> bool {
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        match files.get_mut(id) {
            Some(file) if file.status != status && file.status != FileStatus::Saved => {
                Arc::make_mut(file).status = status;
                true
            }
            _ => false,
        }
    }

    pub fn file(&self, id: &FileId) -> Option<Arc<BinaryFile>> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn has_file(&self, id: &FileId) -> bool {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Snapshot of the asset map.
    pub fn files(&self) -> HashMap<FileId, Arc<BinaryFile>> {
        self.files.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn same_collection(current: &[Arc<Element>], next: &[Arc<Element>]) -> bool {
    current.len() == next.len()
        && current
            .iter()
            .zip(next)
            .all(|(a, b)| Arc::ptr_eq(a, b) || a == b)
}
