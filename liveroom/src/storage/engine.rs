//! Op application against a room's loaded storage.
//!
//! Each op ends in exactly one of three outcomes:
//!
//! | Outcome  | When                                                  | Who hears about it            |
//! |----------|-------------------------------------------------------|-------------------------------|
//! | accepted | the tree changed (maybe at a server-chosen position)  | everyone; author gets op id   |
//! | ignored  | the op lost a race (target gone, slot taken, replay)  | author only, as an ACK        |
//! | rejected | the op can never be valid (shape, type, store error)  | author only, as a reject      |

use std::sync::Arc;

use super::driver::Driver;
use super::loaded::LoadedTree;
use super::position;
use super::tree::{Node, NodeTree, TreeError, ROOT_ID};
use super::ydoc::YDocStore;
use super::StorageError;
use crate::protocol::{CrdtType, Op, OpKind, SerializedCrdt};

/// Result of applying one op.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// `op` as received (op id included). `fix` moves the created or moved
    /// node to where the server actually put it.
    Accepted { op: Op, fix: Option<Op> },
    Ignored { op_id: Option<String> },
    Rejected { op_id: Option<String>, reason: String },
}

/// Freshly loaded storage, ready to be installed into a room.
pub struct LoadedParts {
    pub tree: LoadedTree,
    pub ydoc: YDocStore,
}

impl LoadedParts {
    /// Blocking: reads and repairs the room's rows.
    pub fn load(room_id: &str, driver: Arc<dyn Driver>) -> Result<Self, StorageError> {
        let tree = LoadedTree::load(room_id, driver.clone())?;
        let ydoc = YDocStore::load(room_id, driver)?;
        Ok(Self { tree, ydoc })
    }
}

/// A room's storage: unloaded, or holding the node tree and binary doc.
#[derive(Default)]
pub struct Storage {
    parts: Option<LoadedParts>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.parts.is_some()
    }

    pub fn install(&mut self, parts: LoadedParts) {
        self.parts = Some(parts);
    }

    /// Drop the in-memory state. Everything is already persisted.
    pub fn unload(&mut self) {
        self.parts = None;
    }

    pub fn tree(&self) -> Result<&LoadedTree, StorageError> {
        self.parts.as_ref().map(|p| &p.tree).ok_or(StorageError::NotLoaded)
    }

    pub fn ydoc(&self) -> Result<&YDocStore, StorageError> {
        self.parts.as_ref().map(|p| &p.ydoc).ok_or(StorageError::NotLoaded)
    }

    pub fn ydoc_mut(&mut self) -> Result<&mut YDocStore, StorageError> {
        self.parts.as_mut().map(|p| &mut p.ydoc).ok_or(StorageError::NotLoaded)
    }

    pub fn apply_op(&mut self, op: &Op) -> ApplyOutcome {
        let Some(parts) = self.parts.as_mut() else {
            return ApplyOutcome::Rejected {
                op_id: op.op_id.clone(),
                reason: StorageError::NotLoaded.to_string(),
            };
        };
        match apply(&mut parts.tree, op) {
            Ok(None) => ApplyOutcome::Accepted {
                op: op.clone(),
                fix: None,
            },
            Ok(Some(parent_key)) => {
                let id = op.target_id().unwrap_or_default().to_string();
                let fix = Op::new(op.op_id.clone(), OpKind::SetParentKey { id, parent_key });
                ApplyOutcome::Accepted {
                    op: op.clone(),
                    fix: Some(fix),
                }
            }
            Err(e) => classify(op, e),
        }
    }
}

fn classify(op: &Op, err: StorageError) -> ApplyOutcome {
    let op_id = op.op_id.clone();
    match err {
        StorageError::Tree(
            TreeError::NotFound(_)
            | TreeError::ParentNotFound(_)
            | TreeError::AlreadyExists(_)
            | TreeError::Conflict { .. },
        ) => {
            log::debug!("Ignoring op {op_id:?}: {err}");
            ApplyOutcome::Ignored { op_id }
        }
        StorageError::Tree(e) => ApplyOutcome::Rejected {
            op_id,
            reason: e.to_string(),
        },
        e => {
            log::error!("Op {op_id:?} failed in storage: {e}");
            ApplyOutcome::Rejected {
                op_id,
                reason: e.to_string(),
            }
        }
    }
}

/// Apply one op. Returns the server-chosen key when a LIST position had to
/// be moved off an occupied slot.
fn apply(tree: &mut LoadedTree, op: &Op) -> Result<Option<String>, StorageError> {
    match &op.kind {
        OpKind::Create(c) => {
            if tree.get(&c.id).is_some() {
                return Err(TreeError::AlreadyExists(c.id.clone()).into());
            }
            let parent_type = tree
                .get(&c.parent_id)
                .map(Node::crdt_type)
                .ok_or_else(|| TreeError::ParentNotFound(c.parent_id.clone()))?;
            let mut node = Node::from_serialized(
                c.id.clone(),
                SerializedCrdt::child(c.crdt_type, c.parent_id.clone(), c.parent_key.clone(), c.data.clone()),
            )?;
            let occupied = tree.child_at(&c.parent_id, &c.parent_key).is_some();
            match parent_type {
                CrdtType::List if occupied && !c.intent_set => {
                    let key = free_position(tree.tree(), &c.parent_id, &c.parent_key)?;
                    node.parent_key = Some(key.clone());
                    tree.set_child(node, false)?;
                    Ok(Some(key))
                }
                CrdtType::List => {
                    tree.set_child(node, c.intent_set)?;
                    Ok(None)
                }
                // Last writer wins on object and map keys
                _ => {
                    tree.set_child(node, true)?;
                    Ok(None)
                }
            }
        }
        OpKind::UpdateObject { id, data } => {
            tree.set_object_data(id, data, true)?;
            Ok(None)
        }
        OpKind::DeleteCrdt { id } => {
            if id == ROOT_ID {
                return Err(TreeError::NotFound(id.clone()).into());
            }
            tree.delete_node(id)?;
            Ok(None)
        }
        OpKind::DeleteObjectKey { id, key } => {
            tree.delete_child_key(id, key)?;
            Ok(None)
        }
        OpKind::SetParentKey { id, parent_key } => {
            let node = tree.get(id).ok_or_else(|| TreeError::NotFound(id.clone()))?;
            let parent_id = node
                .parent_id
                .clone()
                .ok_or_else(|| TreeError::MissingParent(id.clone()))?;
            let parent_type = tree.get(&parent_id).map(Node::crdt_type);
            match tree.move_sibling(id, parent_key) {
                Err(StorageError::Tree(TreeError::Conflict { .. })) if parent_type == Some(CrdtType::List) => {
                    let key = free_position(tree.tree(), &parent_id, parent_key)?;
                    tree.move_sibling(id, &key)?;
                    Ok(Some(key))
                }
                other => other.map(|_| None),
            }
        }
        OpKind::Ack => Err(TreeError::NotFound(String::new()).into()),
    }
}

/// A free LIST position right after the occupied `key`.
fn free_position(tree: &NodeTree, parent_id: &str, key: &str) -> Result<String, TreeError> {
    let next = tree.next_sibling_key(parent_id, key);
    let candidate = position::between(Some(key), next);
    if tree.child_at(parent_id, &candidate).is_some() {
        return Err(TreeError::Conflict {
            parent_id: parent_id.to_string(),
            key: candidate,
        });
    }
    Ok(candidate)
}
