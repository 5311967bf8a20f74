//! Library items: reusable groups of elements shared by every scene of a
//! replica's storage.
//!
//! Persisted under `library-blob` with their own entry in the version
//! record, so sibling replicas pick up library edits the same way they pick
//! up scene edits.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItem {
    pub id: String,
    /// Milliseconds since epoch when the item was added.
    #[serde(default)]
    pub created: u64,
    /// Element payloads, kept as the host wrote them.
    #[serde(default)]
    pub elements: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LibraryItem {
    pub fn new(id: impl Into<String>, created: u64) -> Self {
        Self {
            id: id.into(),
            created,
            elements: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibraryFile {
    #[serde(default)]
    library_items: Vec<Value>,
}

/// Parse stored library items: a bare array, or a library file
/// (`{"libraryItems": [...]}`). Malformed items are dropped.
pub fn parse_library(bytes: &[u8]) -> serde_json::Result<Vec<LibraryItem>> {
    let raw = match serde_json::from_slice::<Value>(bytes)? {
        Value::Array(items) => items,
        other => serde_json::from_value::<LibraryFile>(other)?.library_items,
    };
    Ok(raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value::<LibraryItem>(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping malformed library item at index {}: {}", index, e);
                None
            }
        })
        .collect())
}

pub fn serialize_library(items: &[LibraryItem]) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_unknown_fields_and_drops_malformed() {
        let json = br#"[{"id":"i1","created":5,"status":"published","elements":[{"id":"a"}]},{"created":1}]"#;
        let items = parse_library(json).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "i1");
        assert_eq!(items[0].elements.len(), 1);
        assert_eq!(items[0].extra["status"], "published");

        let written = serialize_library(&items).unwrap();
        assert_eq!(parse_library(&written).unwrap(), items);
    }

    #[test]
    fn test_parse_library_file() {
        let json = br#"{"type":"excalidrawlib","version":2,"libraryItems":[{"id":"i1"}]}"#;
        assert_eq!(parse_library(json).unwrap()[0].id, "i1");
        assert!(parse_library(b"\"nope\"").is_err());
    }
}
