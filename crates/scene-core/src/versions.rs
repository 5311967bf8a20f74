//! VersionDataState: cheap "is the other replica's copy newer?" checks.
//!
//! Every persisted key carries a `{version, timestamp}` entry. Comparing the
//! entry a replica last observed with the one currently in storage tells it
//! whether a sibling wrote since, without diffing content.

use crate::storage::{Storage, keys};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Version record for one logical key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u64,
    /// Milliseconds since epoch of the write.
    pub timestamp: u64,
}

impl VersionEntry {
    /// Strictly greater version, or equal version with a later timestamp.
    pub fn is_newer_than(&self, other: &VersionEntry) -> bool {
        self.version > other.version
            || (self.version == other.version && self.timestamp > other.timestamp)
    }

    /// The newer of two entries.
    pub fn max(self, other: VersionEntry) -> VersionEntry {
        if other.is_newer_than(&self) { other } else { self }
    }

    /// Entry for a write that follows both `stored` and `known`.
    ///
    /// The version is strictly above both inputs, so a persisted version never
    /// decreases regardless of which replica wrote last.
    pub fn next_after(stored: VersionEntry, known: VersionEntry, now_ms: u64) -> VersionEntry {
        VersionEntry {
            version: stored.version.max(known.version) + 1,
            timestamp: now_ms,
        }
    }
}

/// Logical keys tracked in the version record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    Elements,
    AppState,
    Files,
    Library,
}

impl StateKey {
    pub const ALL: [StateKey; 4] = [
        StateKey::Elements,
        StateKey::AppState,
        StateKey::Files,
        StateKey::Library,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::Elements => "elements",
            StateKey::AppState => "appState",
            StateKey::Files => "files",
            StateKey::Library => "library",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDataState {
    #[serde(default)]
    pub elements: VersionEntry,
    #[serde(default)]
    pub app_state: VersionEntry,
    #[serde(default)]
    pub files: VersionEntry,
    #[serde(default)]
    pub library: VersionEntry,
}

impl VersionDataState {
    pub fn get(&self, key: StateKey) -> VersionEntry {
        match key {
            StateKey::Elements => self.elements,
            StateKey::AppState => self.app_state,
            StateKey::Files => self.files,
            StateKey::Library => self.library,
        }
    }

    pub fn set(&mut self, key: StateKey, entry: VersionEntry) {
        match key {
            StateKey::Elements => self.elements = entry,
            StateKey::AppState => self.app_state = entry,
            StateKey::Files => self.files = entry,
            StateKey::Library => self.library = entry,
        }
    }

    /// Keys for which `stored` is newer than `self`.
    pub fn stale_keys(&self, stored: &VersionDataState) -> Vec<StateKey> {
        StateKey::ALL
            .into_iter()
            .filter(|key| stored.get(*key).is_newer_than(&self.get(*key)))
            .collect()
    }
}

/// Read the version record. Missing or unparsable records read as "nothing
/// persisted yet".
pub async fn read_version_state(storage: &dyn Storage) -> crate::storage::Result<VersionDataState> {
    let Some(bytes) = storage.get(keys::VERSION_DATA_STATE).await? else {
        return Ok(VersionDataState::default());
    };
    match serde_json::from_slice(&bytes) {
        Ok(state) => Ok(state),
        Err(e) => {
            warn!("Corrupt version record, treating as empty: {}", e);
            Ok(VersionDataState::default())
        }
    }
}
