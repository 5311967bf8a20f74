//! Directory-backed remote sources.
//!
//! Stands in for the hosted backends when running headless. Layout under
//! the root directory:
//!
//! ```text
//! shareLinks/<id>.json           share link scenes
//! rooms/<roomId>.json            collaboration room snapshots
//! legacy/<id>.json               keyless legacy share links
//! files/shareLinks/<id>/<fileId> assets of a share link
//! files/rooms/<roomId>/<fileId>  assets of a room
//! <container>/<fileId>.mime      optional mime type next to an asset
//! ```
//!
//! Access keys are accepted but not checked: the directory holds plain
//! content.

use async_trait::async_trait;
use scene_core::files::{BinaryFile, FetchError, FetchOutcome, RemoteFileSource, Result};
use scene_core::{FileId, RemoteSceneSource, SceneData};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tracing::{debug, warn};

/// Mime type used when an asset has no `.mime` sidecar.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path under the root, refusing anything that would
    /// climb out of it.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        if relative.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(FetchError::Remote(format!("Invalid path: {}", relative)));
        }
        Ok(self.root.join(path))
    }

    async fn read_scene(&self, relative: &str) -> Result<SceneData> {
        let path = self.resolve(relative)?;
        let bytes = fs::read(&path)
            .await
            .map_err(|e| FetchError::Remote(format!("{}: {}", path.display(), e)))?;
        SceneData::from_json(&bytes)
            .map_err(|e| FetchError::Remote(format!("{}: {}", path.display(), e)))
    }

    async fn read_file(&self, dir: &Path, id: &FileId) -> std::io::Result<Option<BinaryFile>> {
        let path = dir.join(id.as_str());
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mime_type = match fs::read_to_string(dir.join(format!("{}.mime", id))).await {
            Ok(mime) => mime.trim().to_string(),
            Err(_) => DEFAULT_MIME_TYPE.to_string(),
        };
        let created = fs::metadata(&path)
            .await
            .and_then(|metadata| metadata.modified())
            .map(|t| {
                t.duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(Some(BinaryFile::new(id.clone(), mime_type, data, created)))
    }
}

#[async_trait]
impl RemoteFileSource for DirSource {
    async fn fetch_files(
        &self,
        container: &str,
        _access_key: &str,
        ids: &[FileId],
    ) -> Result<FetchOutcome> {
        let dir = self.resolve(container)?;
        let mut outcome = FetchOutcome::default();

        for id in ids {
            if id.as_str().contains(['/', '\\']) || id.as_str().starts_with('.') {
                outcome.errored_files.insert(id.clone());
                continue;
            }
            match self.read_file(&dir, id).await {
                Ok(Some(file)) => outcome.loaded_files.push(file),
                Ok(None) => {
                    debug!("File {} not found in {}", id, container);
                    outcome.errored_files.insert(id.clone());
                }
                Err(e) => {
                    warn!("Failed to read file {} from {}: {}", id, container, e);
                    outcome.errored_files.insert(id.clone());
                }
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
impl RemoteSceneSource for DirSource {
    async fn load_share_link(&self, id: &str, _key: &str) -> Result<SceneData> {
        self.read_scene(&format!("shareLinks/{}.json", id)).await
    }

    /// `file://` urls and plain paths are read from disk; anything else is
    /// unsupported offline.
    async fn load_url(&self, url: &str) -> Result<SceneData> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        if path.contains("://") {
            return Err(FetchError::Remote(format!("Unsupported url: {}", url)));
        }
        let bytes = fs::read(path)
            .await
            .map_err(|e| FetchError::Remote(format!("{}: {}", path, e)))?;
        SceneData::from_json(&bytes).map_err(|e| FetchError::Remote(format!("{}: {}", path, e)))
    }

    async fn join_room(&self, room_id: &str, _room_key: &str) -> Result<SceneData> {
        let relative = format!("rooms/{}.json", room_id);
        match self.read_scene(&relative).await {
            Ok(scene) => Ok(scene),
            Err(e) => match fs::try_exists(self.root.join(&relative)).await {
                Ok(false) => {
                    // A fresh room starts empty
                    debug!("Room {} has no snapshot yet ({})", room_id, e);
                    Ok(SceneData::default())
                }
                _ => Err(e),
            },
        }
    }

    async fn load_legacy(&self, id: &str) -> Result<SceneData> {
        self.read_scene(&format!("legacy/{}.json", id)).await
    }
}
