//! In-memory CRDT node tree.
//!
//! ```text
//! nodes:    id ──────────────► Node { parent_id, parent_key, data }
//! children: parent_id ──► BTreeMap<parent_key, child_id>
//! ```
//!
//! The `children` index is derived from `nodes` and never persisted. Keys
//! are kept sorted so LIST children come out in position order.
//!
//! An OBJECT's static data fields and its child slots share one key space.
//! Every mutation here keeps that true, and keeps the tree rooted, acyclic
//! and free of duplicate slot occupants.
//!
//! Between [`NodeTree::begin`] and [`NodeTree::commit`] the tree journals the
//! prior state of every node it touches, so [`NodeTree::rollback`] can undo a
//! mutation whose write-through failed.

use std::collections::BTreeMap;
use std::ops::Bound;

use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{CrdtType, JsonObject, SerializedCrdt};

/// Id of the root OBJECT.
pub const ROOT_ID: &str = "root";

/// Per-type payload of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Object(JsonObject),
    List,
    Map,
    Register(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub parent_id: Option<String>,
    pub parent_key: Option<String>,
    pub data: NodeData,
}

impl Node {
    pub fn root() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            parent_id: None,
            parent_key: None,
            data: NodeData::Object(JsonObject::new()),
        }
    }

    pub fn crdt_type(&self) -> CrdtType {
        match self.data {
            NodeData::Object(_) => CrdtType::Object,
            NodeData::List => CrdtType::List,
            NodeData::Map => CrdtType::Map,
            NodeData::Register(_) => CrdtType::Register,
        }
    }

    pub fn to_serialized(&self) -> SerializedCrdt {
        let data = match &self.data {
            NodeData::Object(fields) => Some(Value::Object(fields.clone())),
            NodeData::Register(value) => Some(value.clone()),
            NodeData::List | NodeData::Map => None,
        };
        SerializedCrdt {
            crdt_type: self.crdt_type(),
            parent_id: self.parent_id.clone(),
            parent_key: self.parent_key.clone(),
            data,
        }
    }

    /// Rebuild a node from its row. OBJECT data must be a JSON object.
    pub fn from_serialized(id: impl Into<String>, crdt: SerializedCrdt) -> Result<Self, TreeError> {
        let id = id.into();
        let data = match crdt.crdt_type {
            CrdtType::Object => match crdt.data {
                None => NodeData::Object(JsonObject::new()),
                Some(Value::Object(fields)) => NodeData::Object(fields),
                Some(_) => return Err(TreeError::InvalidData(id)),
            },
            CrdtType::List => NodeData::List,
            CrdtType::Map => NodeData::Map,
            CrdtType::Register => NodeData::Register(crdt.data.unwrap_or(Value::Null)),
        };
        Ok(Self {
            id,
            parent_id: crdt.parent_id,
            parent_key: crdt.parent_key,
            data,
        })
    }

    pub fn object_fields(&self) -> Option<&JsonObject> {
        match &self.data {
            NodeData::Object(fields) => Some(fields),
            _ => None,
        }
    }
}

/// Whether a child of `child` type may hang under a `parent` type node.
///
/// REGISTERs never have children, and an OBJECT keeps its scalars as static
/// fields rather than REGISTER children.
pub fn can_contain(parent: CrdtType, child: CrdtType) -> bool {
    match (parent, child) {
        (CrdtType::Register, _) => false,
        (CrdtType::Object, CrdtType::Register) => false,
        _ => true,
    }
}

/// Rows touched by one mutation, for write-through.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TreeDelta {
    /// Nodes whose row must be (re)written.
    pub upserted: Vec<String>,
    /// Nodes whose row must be removed.
    pub deleted: Vec<String>,
}

impl TreeDelta {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.deleted.is_empty()
    }

    fn upsert(mut self, id: &str) -> Self {
        self.upserted.push(id.to_string());
        self
    }
}

/// Tree invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("Node not found: {0}")]
    NotFound(String),
    #[error("Parent not found: {0}")]
    ParentNotFound(String),
    #[error("Node already exists: {0}")]
    AlreadyExists(String),
    #[error("Slot {key:?} under {parent_id} is occupied")]
    Conflict { parent_id: String, key: String },
    #[error("Node {id} cannot be a child of {parent_id}")]
    InvalidParent { id: String, parent_id: String },
    #[error("Node {0} has the wrong type for this operation")]
    TypeMismatch(String),
    #[error("Node {0} has no parent")]
    MissingParent(String),
    #[error("Node {0} has malformed data")]
    InvalidData(String),
}

/// Arena of nodes plus the derived slot index.
#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: FxHashMap<String, Node>,
    children: FxHashMap<String, BTreeMap<String, String>>,
    /// Pre-images of touched nodes (`None`: did not exist), while journaling.
    journal: Option<FxHashMap<String, Option<Node>>>,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    /// A tree holding only the empty root.
    pub fn new() -> Self {
        let mut nodes = FxHashMap::default();
        nodes.insert(ROOT_ID.to_string(), Node::root());
        Self {
            nodes,
            children: FxHashMap::default(),
            journal: None,
        }
    }

    /// A tree with no nodes at all, to be filled by repair.
    pub(crate) fn default_empty() -> Self {
        Self {
            nodes: FxHashMap::default(),
            children: FxHashMap::default(),
            journal: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Never true: the root always exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Child occupying `(parent_id, key)`. Static data fields never match.
    pub fn child_at(&self, parent_id: &str, key: &str) -> Option<&str> {
        self.children
            .get(parent_id)
            .and_then(|slots| slots.get(key))
            .map(String::as_str)
    }

    /// Children of `parent_id` in key order, as `(key, child_id)`.
    pub fn children_of<'a>(&'a self, parent_id: &str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.children
            .get(parent_id)
            .into_iter()
            .flat_map(|slots| slots.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// First occupied key strictly after `key` under `parent_id`.
    pub fn next_sibling_key(&self, parent_id: &str, key: &str) -> Option<&str> {
        self.children.get(parent_id).and_then(|slots| {
            slots
                .range::<str, _>((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.as_str())
        })
    }

    /// Insert `node` at its `(parent_id, parent_key)` slot.
    ///
    /// With `allow_overwrite`, whatever occupies the slot (a static field of
    /// an OBJECT parent, or a child subtree) is removed first.
    pub fn set_child(&mut self, node: Node, allow_overwrite: bool) -> Result<TreeDelta, TreeError> {
        if self.nodes.contains_key(&node.id) {
            return Err(TreeError::AlreadyExists(node.id));
        }
        let (parent_id, key) = match (&node.parent_id, &node.parent_key) {
            (Some(p), Some(k)) => (p.clone(), k.clone()),
            _ => return Err(TreeError::MissingParent(node.id)),
        };
        let parent = self
            .nodes
            .get(&parent_id)
            .ok_or_else(|| TreeError::ParentNotFound(parent_id.clone()))?;
        if !can_contain(parent.crdt_type(), node.crdt_type()) {
            return Err(TreeError::InvalidParent {
                id: node.id,
                parent_id,
            });
        }
        let field_collision = parent
            .object_fields()
            .is_some_and(|fields| fields.contains_key(&key));
        let occupant = self.child_at(&parent_id, &key).map(str::to_string);
        if (field_collision || occupant.is_some()) && !allow_overwrite {
            return Err(TreeError::Conflict { parent_id, key });
        }

        let mut delta = TreeDelta::default();
        if let Some(occupant) = occupant {
            delta.deleted.extend(self.remove_subtree(&occupant));
        }
        if field_collision {
            self.record(&parent_id);
            if let Some(NodeData::Object(fields)) = self.nodes.get_mut(&parent_id).map(|p| &mut p.data) {
                fields.remove(&key);
            }
            delta.upserted.push(parent_id.clone());
        }
        let id = node.id.clone();
        self.record(&id);
        self.link(&parent_id, &key, &id);
        self.nodes.insert(id.clone(), node);
        Ok(delta.upsert(&id))
    }

    /// Move `id` to `new_key` under its current parent.
    pub fn move_sibling(&mut self, id: &str, new_key: &str) -> Result<TreeDelta, TreeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))?;
        let (parent_id, old_key) = match (&node.parent_id, &node.parent_key) {
            (Some(p), Some(k)) => (p.clone(), k.clone()),
            _ => return Err(TreeError::MissingParent(id.to_string())),
        };
        if old_key == new_key {
            return Ok(TreeDelta::default());
        }
        let field_collision = self
            .nodes
            .get(&parent_id)
            .and_then(Node::object_fields)
            .is_some_and(|fields| fields.contains_key(new_key));
        if field_collision || self.child_at(&parent_id, new_key).is_some() {
            return Err(TreeError::Conflict {
                parent_id,
                key: new_key.to_string(),
            });
        }

        self.record(id);
        self.unlink(&parent_id, &old_key, id);
        self.link(&parent_id, new_key, id);
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent_key = Some(new_key.to_string());
        }
        Ok(TreeDelta::default().upsert(id))
    }

    /// Merge `patch` into an OBJECT's static fields.
    ///
    /// Nothing changes unless every key can be written.
    pub fn set_object_data(
        &mut self,
        id: &str,
        patch: &JsonObject,
        allow_overwrite: bool,
    ) -> Result<TreeDelta, TreeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))?;
        if node.object_fields().is_none() {
            return Err(TreeError::TypeMismatch(id.to_string()));
        }
        let mut displaced = Vec::new();
        for key in patch.keys() {
            if let Some(child) = self.child_at(id, key) {
                if !allow_overwrite {
                    return Err(TreeError::Conflict {
                        parent_id: id.to_string(),
                        key: key.clone(),
                    });
                }
                displaced.push(child.to_string());
            }
        }

        let mut delta = TreeDelta::default();
        for child in displaced {
            delta.deleted.extend(self.remove_subtree(&child));
        }
        self.record(id);
        if let Some(NodeData::Object(fields)) = self.nodes.get_mut(id).map(|n| &mut n.data) {
            for (k, v) in patch {
                fields.insert(k.clone(), v.clone());
            }
        }
        Ok(delta.upsert(id))
    }

    /// Remove the static field `key`, or else the child subtree at `key`.
    pub fn delete_child_key(&mut self, id: &str, key: &str) -> Result<TreeDelta, TreeError> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| TreeError::NotFound(id.to_string()))?;
        if node.object_fields().is_some_and(|fields| fields.contains_key(key)) {
            self.record(id);
            if let Some(NodeData::Object(fields)) = self.nodes.get_mut(id).map(|n| &mut n.data) {
                fields.remove(key);
            }
            return Ok(TreeDelta::default().upsert(id));
        }
        match self.child_at(id, key).map(str::to_string) {
            Some(child) => Ok(TreeDelta {
                upserted: Vec::new(),
                deleted: self.remove_subtree(&child),
            }),
            None => Ok(TreeDelta::default()),
        }
    }

    /// Delete `id` and its descendants. Deleting the root does nothing.
    pub fn delete_node(&mut self, id: &str) -> Result<TreeDelta, TreeError> {
        if id == ROOT_ID {
            return Ok(TreeDelta::default());
        }
        if !self.nodes.contains_key(id) {
            return Err(TreeError::NotFound(id.to_string()));
        }
        Ok(TreeDelta {
            upserted: Vec::new(),
            deleted: self.remove_subtree(id),
        })
    }

    /// Ids in root-first depth-first order, siblings in key order.
    pub fn root_first(&self) -> Vec<&str> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let Some((root, _)) = self.nodes.get_key_value(ROOT_ID) else {
            return order;
        };
        let mut stack = vec![root.as_str()];
        while let Some(id) = stack.pop() {
            if let Some(slots) = self.children.get(id) {
                stack.extend(slots.values().rev().map(String::as_str));
            }
            order.push(id);
        }
        order
    }

    /// Every node serialized in [`root_first`](Self::root_first) order.
    pub fn serialize_all(&self) -> Vec<(String, SerializedCrdt)> {
        self.root_first()
            .into_iter()
            .filter_map(|id| self.nodes.get(id).map(|n| (id.to_string(), n.to_serialized())))
            .collect()
    }

    /// Insert without any checks. The caller guarantees the invariants.
    pub(crate) fn insert_unchecked(&mut self, node: Node) {
        if let (Some(parent_id), Some(key)) = (&node.parent_id, &node.parent_key) {
            let (parent_id, key) = (parent_id.clone(), key.clone());
            self.link(&parent_id, &key, &node.id);
        }
        self.nodes.insert(node.id.clone(), node);
    }

    // ─── Journal ──────────────────────────────────────────────────────

    /// Start journaling. A journal already open is discarded.
    pub(crate) fn begin(&mut self) {
        self.journal = Some(FxHashMap::default());
    }

    /// Keep every change made since [`begin`](Self::begin).
    pub(crate) fn commit(&mut self) {
        self.journal = None;
    }

    /// Undo every change made since [`begin`](Self::begin).
    pub(crate) fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for id in journal.keys() {
            if let Some(current) = self.nodes.remove(id) {
                if let (Some(parent_id), Some(key)) = (&current.parent_id, &current.parent_key) {
                    self.unlink(parent_id, key, id);
                }
            }
        }
        for node in journal.into_values().flatten() {
            self.insert_unchecked(node);
        }
    }

    /// Remember `id` as it is now, the first time it is touched.
    fn record(&mut self, id: &str) {
        if let Some(journal) = &mut self.journal {
            if !journal.contains_key(id) {
                journal.insert(id.to_string(), self.nodes.get(id).cloned());
            }
        }
    }

    fn link(&mut self, parent_id: &str, key: &str, id: &str) {
        self.children
            .entry(parent_id.to_string())
            .or_default()
            .insert(key.to_string(), id.to_string());
    }

    fn unlink(&mut self, parent_id: &str, key: &str, id: &str) {
        if let Some(slots) = self.children.get_mut(parent_id) {
            if slots.get(key).map(String::as_str) == Some(id) {
                slots.remove(key);
            }
            if slots.is_empty() {
                self.children.remove(parent_id);
            }
        }
    }

    fn remove_subtree(&mut self, id: &str) -> Vec<String> {
        if let Some(node) = self.nodes.get(id) {
            if let (Some(parent_id), Some(key)) = (node.parent_id.clone(), node.parent_key.clone()) {
                self.unlink(&parent_id, &key, id);
            }
        }
        let mut removed = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(slots) = self.children.remove(&current) {
                stack.extend(slots.into_values());
            }
            self.record(&current);
            if self.nodes.remove(&current).is_some() {
                removed.push(current);
            }
        }
        removed
    }
}
