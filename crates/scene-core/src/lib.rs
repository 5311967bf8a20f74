//! scene-core: reconciliation and persistence sync for collaborative scenes.
//!
//! This crate provides:
//! - Versioned elements and the order-independent `reconcile` merge
//! - An in-memory scene store with atomic snapshot swaps
//! - Binary asset fetch/cache/save with in-flight dedup
//! - Debounced, never-regress persistence to a shared `Storage`
//! - Cross-replica staleness checks through a version record
//! - Library items persisted next to the scene
//! - `SceneSession`, which wires the above to host events

pub mod app_state;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod element;
pub mod events;
pub mod files;
pub mod library;
pub mod locator;
pub mod payload;
pub mod persistence;
pub mod reconcile;
pub mod replica;
pub mod session;
pub mod source;
pub mod storage;
pub mod store;
pub mod tab_sync;
pub mod versions;

pub use app_state::AppStateSubset;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use element::{Element, ElementId, FileId, ImageStatus, parse_elements, serialize_elements};
pub use events::{Anomaly, ChangeOrigin, EventBus, SceneEvent, Subscription};
pub use files::{
    BinaryFile, FetchError, FetchOutcome, FileManager, FileSource, FileStatus, RemoteFileSource,
    ResolveTask,
};
pub use library::LibraryItem;
pub use locator::{LocatorError, SceneLocator};
pub use payload::{PayloadKind, ScenePayload};
pub use persistence::{LocalData, PersistenceError, SaveReport, SceneSnapshot};
pub use reconcile::{ReconcileContext, Reconciled, reconcile, reconcile_detailed, reconcile_with};
pub use replica::{ReplicaId, ReplicaIdError};
pub use session::{
    LocalChange, SceneSession, SessionEffect, SessionError, SessionEvent, SessionHost,
    UnloadDecision,
};
pub use source::{RemoteSceneSource, SceneData};
pub use storage::{InMemoryStorage, Storage, StorageError};
pub use store::SceneStore;
pub use versions::{StateKey, VersionDataState, VersionEntry};
