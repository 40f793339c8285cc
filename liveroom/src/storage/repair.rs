//! Load-time self-healing of raw node rows.
//!
//! ```text
//! raw rows ──► candidate slot index ──► walk from root ──► NodeTree
//!              (min id wins a slot)     (shape checks,      + RepairReport
//!                                        field/child clash)   (dirty, deleted)
//! ```
//!
//! Rows the walk never reaches are classified and scheduled for deletion.
//! The outcome depends only on the set of rows, never on their order, so
//! every backend heals the same corruption the same way.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};

use super::tree::{can_contain, Node, NodeData, NodeTree, ROOT_ID};
use crate::protocol::{CrdtType, SerializedCrdt};

/// Why a row was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Parent chain ends at a missing or dropped node.
    Orphan,
    /// Part of a parent cycle.
    Cycle,
    /// Another node won the same slot.
    LostConflict { winner: String },
    /// A REGISTER under an OBJECT, or any child of a REGISTER.
    InvalidShape,
    /// Data that does not fit the node type.
    InvalidData,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Orphan => write!(f, "orphan"),
            DropReason::Cycle => write!(f, "cycle member"),
            DropReason::LostConflict { winner } => write!(f, "lost slot to {winner}"),
            DropReason::InvalidShape => write!(f, "invalid shape"),
            DropReason::InvalidData => write!(f, "invalid data"),
        }
    }
}

/// What repair changed. Empty for a healthy tree.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RepairReport {
    /// Surviving nodes whose stored row must be rewritten, sorted.
    pub dirty: Vec<String>,
    /// Dropped rows, sorted by id.
    pub deleted: Vec<(String, DropReason)>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.dirty.is_empty() && self.deleted.is_empty()
    }
}

/// Rebuild a valid tree from raw rows.
pub fn repair(rows: Vec<(String, SerializedCrdt)>) -> (NodeTree, RepairReport) {
    let mut dirty = BTreeSet::new();
    let mut dropped: BTreeMap<String, DropReason> = BTreeMap::new();
    let mut candidates: FxHashMap<String, Node> = FxHashMap::default();
    let mut root = None;

    for (id, crdt) in rows {
        if id == ROOT_ID {
            match Node::from_serialized(id, crdt) {
                Ok(mut node) if node.crdt_type() == CrdtType::Object => {
                    if node.parent_id.is_some() || node.parent_key.is_some() {
                        node.parent_id = None;
                        node.parent_key = None;
                        dirty.insert(ROOT_ID.to_string());
                    }
                    root = Some(node);
                }
                _ => {
                    log::warn!("Root row is malformed, replacing it with an empty object");
                    dirty.insert(ROOT_ID.to_string());
                }
            }
            continue;
        }
        match Node::from_serialized(id.clone(), crdt) {
            Ok(node) if node.parent_id.is_some() && node.parent_key.is_some() => {
                candidates.insert(id, node);
            }
            Ok(_) => {
                dropped.insert(id, DropReason::Orphan);
            }
            Err(_) => {
                dropped.insert(id, DropReason::InvalidData);
            }
        }
    }
    let root = root.unwrap_or_else(|| {
        dirty.insert(ROOT_ID.to_string());
        Node::root()
    });

    // Candidate index: one winner per slot
    let mut slots: FxHashMap<&str, BTreeMap<&str, &str>> = FxHashMap::default();
    let mut losers = Vec::new();
    for node in candidates.values() {
        let (Some(parent_id), Some(key)) = (node.parent_id.as_deref(), node.parent_key.as_deref()) else {
            continue;
        };
        let slot = slots.entry(parent_id).or_default();
        match slot.get(key) {
            Some(&current) if current < node.id.as_str() => {
                losers.push((node.id.clone(), current.to_string()));
            }
            Some(&current) => {
                losers.push((current.to_string(), node.id.clone()));
                slot.insert(key, &node.id);
            }
            None => {
                slot.insert(key, &node.id);
            }
        }
    }
    // A loser recorded early may have lost again later; keep the final winner
    for (loser, _) in losers {
        let Some(node) = candidates.get(&loser) else { continue };
        let winner = node
            .parent_id
            .as_deref()
            .zip(node.parent_key.as_deref())
            .and_then(|(p, k)| slots.get(p).and_then(|s| s.get(k)))
            .map(|w| w.to_string())
            .unwrap_or_default();
        dropped.insert(loser, DropReason::LostConflict { winner });
    }

    // Walk from root
    let mut tree = NodeTree::default_empty();
    let mut visited: FxHashSet<String> = FxHashSet::default();
    let mut stack = vec![root];
    while let Some(mut node) = stack.pop() {
        let child_slots = slots.get(node.id.as_str());
        let mut accepted_keys = BTreeSet::new();
        if let Some(child_slots) = child_slots {
            for (&key, &child_id) in child_slots.iter().rev() {
                let Some(child) = candidates.get(child_id) else { continue };
                if !can_contain(node.crdt_type(), child.crdt_type()) {
                    dropped.insert(child_id.to_string(), DropReason::InvalidShape);
                    continue;
                }
                if visited.contains(child_id) {
                    continue;
                }
                accepted_keys.insert(key.to_string());
                stack.push(child.clone());
            }
        }
        if let NodeData::Object(fields) = &mut node.data {
            let before = fields.len();
            fields.retain(|k, _| !accepted_keys.contains(k));
            if fields.len() != before {
                dirty.insert(node.id.clone());
            }
        }
        visited.insert(node.id.clone());
        tree.insert_unchecked(node);
    }

    // Classify everything the walk missed
    let unvisited: Vec<&String> = candidates
        .keys()
        .filter(|id| !visited.contains(*id) && !dropped.contains_key(*id))
        .collect();
    let mut classified = Vec::new();
    for id in unvisited {
        classified.push((id.clone(), classify(id, &candidates, &dropped)));
    }
    dropped.extend(classified);

    for (id, reason) in &dropped {
        log::warn!("Dropping node {id}: {reason}");
    }
    let dirty: Vec<String> = dirty.into_iter().filter(|id| tree.contains(id)).collect();
    for id in &dirty {
        log::warn!("Rewriting node {id}");
    }

    let report = RepairReport {
        dirty,
        deleted: dropped.into_iter().collect(),
    };
    (tree, report)
}

/// Walk parent links from an unreached node until something explains it.
fn classify(
    start: &str,
    candidates: &FxHashMap<String, Node>,
    dropped: &BTreeMap<String, DropReason>,
) -> DropReason {
    let mut seen = FxHashSet::default();
    let mut current = start;
    loop {
        if !seen.insert(current) {
            return if current == start {
                DropReason::Cycle
            } else {
                DropReason::Orphan
            };
        }
        let Some(parent) = candidates.get(current).and_then(|n| n.parent_id.as_deref()) else {
            return DropReason::Orphan;
        };
        if !candidates.contains_key(parent) || dropped.contains_key(parent) {
            return DropReason::Orphan;
        }
        current = parent;
    }
}
