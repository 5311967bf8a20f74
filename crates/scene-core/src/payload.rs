//! Wire format for scene updates exchanged with collaboration peers.
//!
//! Wire format: `{"type":"sceneUpdate","replica":"<hex>","timestamp":<ms>,"elements":[...]}`
//!
//! `sceneInit` carries the full collection (sent when a peer joins),
//! `sceneUpdate` only the elements changed since the last broadcast. Both
//! are merged the same way: as the `remote` side of a reconciliation.

use crate::element::{Element, elements_from_values};
use crate::replica::ReplicaId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadKind {
    SceneInit,
    SceneUpdate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenePayload {
    pub kind: PayloadKind,
    pub replica: ReplicaId,
    /// Sender wall clock in milliseconds since epoch. Informational only.
    pub timestamp: u64,
    pub elements: Vec<Arc<Element>>,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: PayloadKind,
    replica: ReplicaId,
    timestamp: u64,
    elements: &'a [Arc<Element>],
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    kind: PayloadKind,
    replica: ReplicaId,
    #[serde(default)]
    timestamp: u64,
    elements: Vec<Value>,
}

impl ScenePayload {
    pub fn update(replica: ReplicaId, timestamp: u64, elements: Vec<Arc<Element>>) -> Self {
        Self {
            kind: PayloadKind::SceneUpdate,
            replica,
            timestamp,
            elements,
        }
    }

    pub fn init(replica: ReplicaId, timestamp: u64, elements: Vec<Arc<Element>>) -> Self {
        Self {
            kind: PayloadKind::SceneInit,
            ..Self::update(replica, timestamp, elements)
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&WireOut {
            kind: self.kind,
            replica: self.replica,
            timestamp: self.timestamp,
            elements: &self.elements,
        })
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or an unknown `type`. Individual
    /// malformed elements are dropped rather than failing the payload.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let wire: WireIn = serde_json::from_slice(data).ok()?;
        Some(Self {
            kind: wire.kind,
            replica: wire.replica,
            timestamp: wire.timestamp,
            elements: elements_from_values(wire.elements),
        })
    }
}
