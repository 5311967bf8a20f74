//! Event infrastructure for scene-core.
//!
//! Provides `SceneEvent` for hosts (UI, logging, tests) and `EventBus` for
//! subscriptions. The bus is shared via `Arc` between the store, the
//! persistence manager and the session.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Where a store update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOrigin {
    /// Session start (durable state and/or external scene).
    Load,
    /// Edit made on this replica.
    Local,
    /// Payload from a collaboration peer.
    Peer,
    /// State written by a sibling replica to durable storage.
    Storage,
    /// Foreign collection imported from a file or URL.
    Import,
    /// Image status bookkeeping after fetch or save.
    Status,
}

/// Contained failures surfaced to the user as one-shot notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Anomaly {
    /// An asset or remote scene could not be retrieved.
    FetchFailure,
    /// A persisted blob failed to parse and was treated as absent.
    StorageCorruption,
    /// Duplicate ids or malformed metadata in a merge input.
    MergeAnomaly,
    /// Unsaved asset data would be lost by closing now.
    UnloadDataLoss,
}

/// Events emitted while a scene session runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SceneEvent {
    /// The store's element collection was swapped.
    ElementsReplaced {
        origin: ChangeOrigin,
        /// Number of elements including tombstones.
        total: usize,
        /// Number of non-deleted elements.
        visible: usize,
    },
    /// Assets were added to the store.
    FilesAdded {
        count: usize,
    },
    /// A coalesced write reached durable storage.
    SaveCompleted {
        #[serde(rename = "elementsVersion")]
        elements_version: u64,
        #[serde(rename = "savedFiles")]
        saved_files: usize,
        #[serde(rename = "erroredFiles")]
        errored_files: usize,
    },
    /// Newer state from a sibling replica was pulled in.
    StaleStateImported {
        /// Logical storage key ("elements", "appState" or "files").
        key: String,
    },
    /// A contained failure worth telling the user about.
    Notice {
        anomaly: Anomaly,
        detail: String,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(&SceneEvent) + Send + Sync>;

/// Event bus for publishing scene events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&SceneEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SceneEvent) {
        // Snapshot the callbacks so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }

    /// Emit a `Notice` for a contained failure.
    pub fn notice(&self, anomaly: Anomaly, detail: impl Into<String>) {
        self.emit(SceneEvent::Notice {
            anomaly,
            detail: detail.into(),
        });
    }
}
