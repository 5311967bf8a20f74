//! Native storage implementation using tokio::fs.
//!
//! Every key is one file under the storage directory (`files/<id>` lands in
//! a `files/` subdirectory). Writes go to a hidden temp file first and are
//! renamed into place, so a sibling process never reads a half-written
//! value.

use async_trait::async_trait;
use scene_core::storage::{Result, Storage, StorageError, keys};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Suffix of in-progress writes. The watcher ignores these.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Native storage implementation for the daemon
pub struct NativeStorage {
    base_path: PathBuf,
}

impl NativeStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.contains('\\')
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(name) if !name.to_string_lossy().starts_with('.')));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(relative))
    }

    async fn write_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp = path.with_file_name(format!(".{}{}", file_name, TEMP_SUFFIX));
        fs::write(&temp, content).await.map_err(io_error)?;
        fs::rename(&temp, path).await.map_err(io_error)
    }
}

fn io_error(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

#[async_trait]
impl Storage for NativeStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let full_path = self.full_path(key)?;
        match fs::read(&full_path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn write_batch(&self, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        let mut resolved = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            resolved.push((self.full_path(&key)?, key, value));
        }
        // The version record goes last: readers that see it also see the
        // payloads it describes.
        resolved.sort_by_key(|(_, key, _)| key == keys::VERSION_DATA_STATE);

        for (path, key, value) in resolved {
            self.write_file(&path, &value).await?;
            debug!("Wrote {} ({} bytes)", key, value.len());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut pending = vec![PathBuf::new()];

        while let Some(relative) = pending.pop() {
            let mut dir = match fs::read_dir(self.base_path.join(&relative)).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(e)),
            };

            while let Some(entry) = dir.next_entry().await.map_err(io_error)? {
                let name = entry.file_name().to_string_lossy().to_string();
                // Skip in-progress writes and other hidden entries
                if name.starts_with('.') {
                    continue;
                }
                let child = relative.join(&name);
                let metadata = entry.metadata().await.map_err(io_error)?;
                if metadata.is_dir() {
                    pending.push(child);
                    continue;
                }
                let key = child
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    found.push(key);
                }
            }
        }

        found.sort();
        Ok(found)
    }
}
