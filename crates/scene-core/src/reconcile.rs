//! Reconciliation: deterministic merge of two element collections.
//!
//! `reconcile(local, remote)` is a pure function. For every id it keeps the
//! copy with the highest `(version, versionNonce)`, so the resulting content
//! does not depend on which side is "local", on arrival order, or on how
//! many times an update is applied. Output order is local-biased:
//!
//! 1. Elements known locally keep their relative positions.
//! 2. Elements only the remote side knows are spliced next to their nearest
//!    neighbour in the remote order that is already present in the output
//!    (predecessor first, then successor), or appended when none exists.
//!
//! Tombstones take part like any other element, so a deletion can only be
//! undone by a strictly newer edit.

use crate::element::{Element, ElementId};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Local editing state that must survive a merge.
///
/// Elements the user is dragging, resizing or typing into are kept as-is
/// even when the remote side carries a newer version; the next local edit
/// bumps them past the remote copy anyway.
#[derive(Debug, Clone, Default)]
pub struct ReconcileContext {
    pub editing: HashSet<ElementId>,
}

impl ReconcileContext {
    pub fn editing(ids: impl IntoIterator<Item = ElementId>) -> Self {
        Self {
            editing: ids.into_iter().collect(),
        }
    }
}

/// Merge `remote` into `local`.
pub fn reconcile(local: &[Arc<Element>], remote: &[Arc<Element>]) -> Vec<Arc<Element>> {
    reconcile_with(local, remote, &ReconcileContext::default())
}

/// Merge `remote` into `local`, protecting elements under active local edit.
pub fn reconcile_with(
    local: &[Arc<Element>],
    remote: &[Arc<Element>],
    ctx: &ReconcileContext,
) -> Vec<Arc<Element>> {
    reconcile_detailed(local, remote, ctx).elements
}

/// A merge result plus the anomalies found in its inputs.
#[derive(Debug, Clone, Default)]
pub struct Reconciled {
    pub elements: Vec<Arc<Element>>,
    /// Repeated ids dropped from either input (first occurrence kept).
    pub duplicate_ids: usize,
}

impl Reconciled {
    pub fn has_anomalies(&self) -> bool {
        self.duplicate_ids > 0
    }
}

/// `reconcile_with`, also reporting input anomalies so callers can raise a
/// notice.
pub fn reconcile_detailed(
    local: &[Arc<Element>],
    remote: &[Arc<Element>],
    ctx: &ReconcileContext,
) -> Reconciled {
    let (local, local_dups) = first_occurrences(local, "local");
    if remote.is_empty() {
        return Reconciled {
            elements: local.into_owned(),
            duplicate_ids: local_dups,
        };
    }
    let (remote, remote_dups) = first_occurrences(remote, "remote");

    let remote_by_id: HashMap<&ElementId, &Arc<Element>> =
        remote.iter().map(|element| (&element.id, element)).collect();

    // One segment per local element plus a trailing segment for unanchored
    // remote elements. Remote-only elements are spliced into the segment of
    // their anchor; concatenating the segments yields the final order.
    let mut segments: Vec<Vec<Arc<Element>>> = Vec::with_capacity(local.len() + 1);
    let mut segment_of: HashMap<ElementId, usize> = HashMap::with_capacity(local.len() + remote.len());

    for ours in local.iter() {
        let kept = match remote_by_id.get(&ours.id) {
            None => Arc::clone(ours),
            Some(_) if ctx.editing.contains(&ours.id) => Arc::clone(ours),
            Some(theirs) => pick_winner(ours, theirs),
        };
        segment_of.insert(ours.id.clone(), segments.len());
        segments.push(vec![kept]);
    }

    let tail = segments.len();
    segments.push(Vec::new());

    for (index, theirs) in remote.iter().enumerate() {
        if segment_of.contains_key(&theirs.id) {
            continue;
        }

        let anchor = remote[..index]
            .iter()
            .rev()
            .find_map(|prev| segment_of.get(&prev.id).map(|&s| (s, Anchor::After(&prev.id))))
            .or_else(|| {
                remote[index + 1..]
                    .iter()
                    .find_map(|next| segment_of.get(&next.id).map(|&s| (s, Anchor::Before(&next.id))))
            });

        let segment = match anchor {
            Some((segment, anchor)) => {
                let slot = &mut segments[segment];
                let position = match anchor {
                    Anchor::After(id) => slot.iter().position(|e| &e.id == id).map(|p| p + 1),
                    Anchor::Before(id) => slot.iter().position(|e| &e.id == id),
                }
                .unwrap_or(slot.len());
                slot.insert(position, Arc::clone(theirs));
                segment
            }
            None => {
                segments[tail].push(Arc::clone(theirs));
                tail
            }
        };
        segment_of.insert(theirs.id.clone(), segment);
    }

    Reconciled {
        elements: segments.into_iter().flatten().collect(),
        duplicate_ids: local_dups + remote_dups,
    }
}

enum Anchor<'a> {
    After(&'a ElementId),
    Before(&'a ElementId),
}

/// Choose between two copies of the same element.
///
/// Higher `(version, nonce)` wins. On a full tie with identical content the
/// local object is kept so downstream render caches stay valid. A full tie
/// with different content means a nonce was not re-rolled upstream; the
/// greater canonical encoding wins so every replica picks the same copy.
fn pick_winner(ours: &Arc<Element>, theirs: &Arc<Element>) -> Arc<Element> {
    if Arc::ptr_eq(ours, theirs) {
        return Arc::clone(ours);
    }

    match ours.precedence().cmp(&theirs.precedence()) {
        Ordering::Greater => Arc::clone(ours),
        Ordering::Less => Arc::clone(theirs),
        Ordering::Equal if ours == theirs => Arc::clone(ours),
        Ordering::Equal => {
            warn!(
                "Element {} has conflicting content at version {} with equal nonce",
                ours.id, ours.version
            );
            if ours.canonical_bytes() >= theirs.canonical_bytes() {
                Arc::clone(ours)
            } else {
                Arc::clone(theirs)
            }
        }
    }
}

/// Drop repeated ids, keeping the first occurrence. Also returns how many
/// were dropped.
fn first_occurrences<'a>(elements: &'a [Arc<Element>], side: &str) -> (Cow<'a, [Arc<Element>]>, usize) {
    let mut seen: HashSet<&ElementId> = HashSet::with_capacity(elements.len());
    if elements.iter().all(|e| seen.insert(&e.id)) {
        return (Cow::Borrowed(elements), 0);
    }

    let mut seen: HashSet<&ElementId> = HashSet::with_capacity(elements.len());
    let mut unique = Vec::with_capacity(elements.len());
    for element in elements {
        if seen.insert(&element.id) {
            unique.push(Arc::clone(element));
        } else {
            warn!("Duplicate element id {} in {} collection, keeping first occurrence", element.id, side);
        }
    }
    debug!("Deduplicated {} collection: {} -> {}", side, elements.len(), unique.len());
    let dropped = elements.len() - unique.len();
    (Cow::Owned(unique), dropped)
}
