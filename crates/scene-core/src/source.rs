//! Remote scenes: share links, hosted scene files and collaboration rooms.

use crate::app_state::AppStateSubset;
use crate::element::{Element, elements_from_values};
use crate::files::{FetchError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// A scene as delivered by a remote source.
#[derive(Debug, Clone, Default)]
pub struct SceneData {
    pub elements: Vec<Arc<Element>>,
    pub app_state: Option<AppStateSubset>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SceneFile {
    #[serde(default)]
    elements: Vec<Value>,
    #[serde(default)]
    app_state: Option<AppStateSubset>,
}

impl SceneData {
    /// Parse a scene file (`{"elements": [...], "appState": {...}}`) or a bare
    /// element array. Malformed elements are dropped.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        let file = match value {
            Value::Array(elements) => SceneFile {
                elements,
                app_state: None,
            },
            other => serde_json::from_value(other)?,
        };
        Ok(Self {
            elements: elements_from_values(file.elements),
            app_state: file.app_state,
        })
    }
}

/// Backend serving scenes that do not live in local storage.
#[async_trait]
pub trait RemoteSceneSource: Send + Sync {
    /// Load a stored share link (`#json=<id>,<key>`).
    async fn load_share_link(&self, id: &str, key: &str) -> Result<SceneData>;

    /// Load a scene file hosted at `url` (`#url=...`).
    async fn load_url(&self, url: &str) -> Result<SceneData>;

    /// Join a collaboration room and return its current scene.
    async fn join_room(&self, room_id: &str, room_key: &str) -> Result<SceneData>;

    /// Load a share link from the keyless legacy backend (`?id=...`).
    async fn load_legacy(&self, id: &str) -> Result<SceneData> {
        Err(FetchError::Remote(format!("legacy scene {} is not supported", id)))
    }
}
