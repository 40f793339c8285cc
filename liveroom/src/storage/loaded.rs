//! A room's node tree, loaded and healed, with write-through persistence.

use std::sync::Arc;

use serde_json::Value;

use super::driver::{Driver, NodeBatch};
use super::repair::{repair, RepairReport};
use super::tree::{Node, NodeTree, TreeDelta, TreeError};
use super::StorageError;
use crate::protocol::{JsonObject, SerializedCrdt};

/// The in-memory tree of one room. Every mutation is persisted through the
/// driver before it returns.
pub struct LoadedTree {
    room_id: String,
    driver: Arc<dyn Driver>,
    tree: NodeTree,
    report: RepairReport,
}

impl LoadedTree {
    /// Read the room's rows, repair them, and persist the fixes in one batch.
    pub fn load(room_id: &str, driver: Arc<dyn Driver>) -> Result<Self, StorageError> {
        let rows = driver.load_nodes(room_id)?;
        let row_count = rows.len();
        let (tree, report) = repair(rows);

        if !report.is_clean() {
            let batch = NodeBatch {
                puts: report
                    .dirty
                    .iter()
                    .filter_map(|id| tree.get(id).map(|n| (id.clone(), n.to_serialized())))
                    .collect(),
                deletes: report.deleted.iter().map(|(id, _)| id.clone()).collect(),
            };
            driver.write_nodes(room_id, &batch)?;
            log::warn!(
                "Room {room_id}: repaired storage ({} rewritten, {} dropped)",
                report.dirty.len(),
                report.deleted.len()
            );
        }
        log::info!("Room {room_id}: loaded {} nodes ({row_count} rows)", tree.len());

        Ok(Self {
            room_id: room_id.to_string(),
            driver,
            tree,
            report,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    /// What repair did at load.
    pub fn repair_report(&self) -> &RepairReport {
        &self.report
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.tree.get(id)
    }

    pub fn child_at(&self, parent_id: &str, key: &str) -> Option<&str> {
        self.tree.child_at(parent_id, key)
    }

    pub fn set_child(&mut self, node: Node, allow_overwrite: bool) -> Result<TreeDelta, StorageError> {
        self.write_through(|tree| tree.set_child(node, allow_overwrite))
    }

    pub fn move_sibling(&mut self, id: &str, new_key: &str) -> Result<TreeDelta, StorageError> {
        self.write_through(|tree| tree.move_sibling(id, new_key))
    }

    pub fn set_object_data(
        &mut self,
        id: &str,
        patch: &JsonObject,
        allow_overwrite: bool,
    ) -> Result<TreeDelta, StorageError> {
        self.write_through(|tree| tree.set_object_data(id, patch, allow_overwrite))
    }

    pub fn delete_child_key(&mut self, id: &str, key: &str) -> Result<TreeDelta, StorageError> {
        self.write_through(|tree| tree.delete_child_key(id, key))
    }

    pub fn delete_node(&mut self, id: &str) -> Result<TreeDelta, StorageError> {
        self.write_through(|tree| tree.delete_node(id))
    }

    /// Readable view of the whole tree, root first.
    pub fn snapshot(&self, low_memory: bool) -> Snapshot<'_> {
        if low_memory {
            Snapshot::Lazy {
                tree: &self.tree,
                order: self.tree.root_first(),
            }
        } else {
            Snapshot::Materialized(self.tree.serialize_all())
        }
    }

    /// Apply `mutate` and persist its delta. If either fails the tree is
    /// left exactly as it was.
    fn write_through(
        &mut self,
        mutate: impl FnOnce(&mut NodeTree) -> Result<TreeDelta, TreeError>,
    ) -> Result<TreeDelta, StorageError> {
        self.tree.begin();
        let result = mutate(&mut self.tree)
            .map_err(StorageError::from)
            .and_then(|delta| self.persist(&delta).map(|()| delta));
        match &result {
            Ok(_) => self.tree.commit(),
            Err(e) => {
                if matches!(e, StorageError::Store(_)) {
                    log::error!("Room {}: write failed, mutation rolled back: {e}", self.room_id);
                }
                self.tree.rollback();
            }
        }
        result
    }

    fn persist(&self, delta: &TreeDelta) -> Result<(), StorageError> {
        if delta.is_empty() {
            return Ok(());
        }
        let batch = NodeBatch {
            puts: delta
                .upserted
                .iter()
                .filter_map(|id| self.tree.get(id).map(|n| (id.clone(), n.to_serialized())))
                .collect(),
            deletes: delta.deleted.clone(),
        };
        self.driver.write_nodes(&self.room_id, &batch)?;
        Ok(())
    }
}

/// A point-in-time view of a tree in root-first order.
///
/// The view borrows the tree, so it stays consistent for as long as it lives.
pub enum Snapshot<'a> {
    /// Every node already serialized.
    Materialized(Vec<(String, SerializedCrdt)>),
    /// Only the id order; nodes are serialized as chunks are pulled.
    Lazy { tree: &'a NodeTree, order: Vec<&'a str> },
}

impl<'a> Snapshot<'a> {
    pub fn len(&self) -> usize {
        match self {
            Snapshot::Materialized(items) => items.len(),
            Snapshot::Lazy { order, .. } => order.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consecutive runs of at most `size` nodes. A zero size is treated as one.
    pub fn chunks(&self, size: usize) -> Box<dyn Iterator<Item = Vec<(String, SerializedCrdt)>> + '_> {
        let size = size.max(1);
        match self {
            Snapshot::Materialized(items) => Box::new(items.chunks(size).map(<[_]>::to_vec)),
            Snapshot::Lazy { tree, order } => Box::new(order.chunks(size).map(move |ids| {
                ids.iter()
                    .filter_map(|id| tree.get(id).map(|n| (id.to_string(), n.to_serialized())))
                    .collect()
            })),
        }
    }

    pub fn to_vec(&self) -> Vec<(String, SerializedCrdt)> {
        self.chunks(usize::MAX).flatten().collect()
    }

    /// `[[id, crdt], ...]` as JSON.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.to_vec()).unwrap_or(Value::Null)
    }
}
