//! Element: a versioned drawable unit of a scene.
//!
//! Every element carries the conflict-resolution metadata used by
//! reconciliation:
//! - `version`: edit counter, bumped on every mutation by any replica
//! - `versionNonce`: random tie-breaker, re-rolled on every mutation
//! - `isDeleted`: tombstone flag (deletion is a mutation, never a removal)
//!
//! Everything else (geometry, style, text, ...) lives in an opaque attribute
//! map that reconciliation never interprets.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Stable, globally unique element identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ElementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ElementId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of a binary asset (content-derived or random).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for FileId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Render status of an image element's asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Saved,
    Error,
}

/// A single drawable unit of a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: ElementId,
    pub version: u64,
    pub version_nonce: u32,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ImageStatus>,
    /// Geometry, style and everything else reconciliation treats as opaque.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Element {
    /// Create a new element at version 1 with a fresh nonce.
    pub fn new(id: impl Into<ElementId>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            version_nonce: random_nonce(),
            is_deleted: false,
            file_id: None,
            status: None,
            attributes: Map::new(),
        }
    }

    /// Create an image element referencing `file_id`, initially `pending`.
    pub fn image(id: impl Into<ElementId>, file_id: FileId) -> Self {
        let mut element = Self::new(id);
        element.file_id = Some(file_id);
        element.status = Some(ImageStatus::Pending);
        element
    }

    /// Set an opaque attribute (builder style, no version bump).
    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// `(version, versionNonce)`: the key reconciliation orders replicas by.
    pub fn precedence(&self) -> (u64, u32) {
        (self.version, self.version_nonce)
    }

    /// Image element whose asset reference is set (not a placeholder).
    pub fn is_initialized_image(&self) -> bool {
        self.file_id.is_some()
    }

    /// Bump the version and re-roll the nonce. Call on every mutation.
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.version_nonce = random_nonce();
    }

    /// Return a mutated copy with a bumped version.
    pub fn mutated(&self, update: impl FnOnce(&mut Element)) -> Element {
        let mut next = self.clone();
        update(&mut next);
        next.bump_version();
        next
    }

    /// Return a tombstoned copy with a bumped version.
    pub fn deleted(&self) -> Element {
        self.mutated(|e| e.is_deleted = true)
    }

    /// Canonical JSON encoding used as the last-resort tie-break.
    ///
    /// Attribute maps are ordered, so equal content encodes to equal bytes.
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

fn random_nonce() -> u32 {
    rand::rng().random()
}

/// Parse a serialized element collection, skipping malformed entries.
///
/// A collection that is not a JSON array at all is an error; individual
/// elements with missing or malformed version metadata are dropped with a
/// warning so one bad entry cannot discard the whole scene.
pub fn parse_elements(bytes: &[u8]) -> serde_json::Result<Vec<Arc<Element>>> {
    let raw: Vec<Value> = serde_json::from_slice(bytes)?;
    Ok(elements_from_values(raw))
}

pub(crate) fn elements_from_values(raw: Vec<Value>) -> Vec<Arc<Element>> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value::<Element>(value) {
            Ok(element) => Some(Arc::new(element)),
            Err(e) => {
                warn!("Skipping malformed element at index {}: {}", index, e);
                None
            }
        })
        .collect()
}

/// Serialize an element collection (tombstones included).
pub fn serialize_elements(elements: &[Arc<Element>]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(elements)
}
