//! scene-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod dir_source;
pub mod native_storage;
pub mod watcher;

// Re-export key types for convenience
pub use dir_source::DirSource;
pub use native_storage::NativeStorage;
pub use watcher::{StorageEvent, StorageEventKind, StorageWatcher};
