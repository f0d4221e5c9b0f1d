// src/core/crdt/mod.rs

//! The CRDT replica: an arena of live nodes plus the op-application machinery.
//!
//! Nodes are kept in a flat pool keyed by node id; parent and child links
//! store ids only, so the tree carries no reference cycles. The root is the
//! unique node without a parent link. All mutations flow through
//! [`NodePool::apply_op`], which returns the per-node update descriptor and
//! the reverse ops feeding the history engine.

pub mod list;
pub mod map;
pub mod object;
pub mod position;
pub mod register;

use crate::core::protocol::{JsonObject, Op, ParentRef, SerializedCrdt};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

pub use list::{ListDelta, ListEntry, ListState};
pub use map::{MapDelta, MapState};
pub use object::{ObjectDelta, ObjectState};
pub use register::RegisterState;

/// Where an op came from, which decides how conflicts and bookkeeping are
/// treated during apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    /// A reliable local (re)apply: first dispatch, undo/redo, or the
    /// post-reconnect resend.
    Local,
    /// A server echo of one of our own ops; the replica already reflects it.
    Ack,
    /// An op authored by another client.
    Remote,
}

/// One CRDT node in the pool.
#[derive(Debug, Clone)]
pub struct LiveNode {
    pub id: String,
    pub parent: Option<ParentRef>,
    pub body: NodeBody,
}

#[derive(Debug, Clone)]
pub enum NodeBody {
    Object(ObjectState),
    List(ListState),
    Map(MapState),
    Register(RegisterState),
}

/// A per-node update descriptor produced by applying ops, carrying enough
/// ancestry to let deep subscriptions filter by subtree.
#[derive(Debug, Clone)]
pub struct StorageUpdate {
    pub node_id: String,
    /// Parent chain of the node at emission time, nearest ancestor first.
    pub ancestors: Vec<String>,
    pub kind: StorageUpdateKind,
}

#[derive(Debug, Clone)]
pub enum StorageUpdateKind {
    Object { updates: IndexMap<String, ObjectDelta> },
    Map { updates: IndexMap<String, MapDelta> },
    List { updates: Vec<ListDelta> },
}

impl StorageUpdate {
    /// Coalesces a later update for the same node into this one.
    pub fn merge(&mut self, other: StorageUpdate) {
        debug_assert_eq!(self.node_id, other.node_id);
        match (&mut self.kind, other.kind) {
            (
                StorageUpdateKind::Object { updates },
                StorageUpdateKind::Object { updates: later },
            ) => updates.extend(later),
            (StorageUpdateKind::Map { updates }, StorageUpdateKind::Map { updates: later }) => {
                updates.extend(later)
            }
            (StorageUpdateKind::List { updates }, StorageUpdateKind::List { updates: later }) => {
                updates.extend(later)
            }
            (_, later) => {
                warn!("Dropping storage update of mismatched kind for node {}", self.node_id);
                let _ = later;
            }
        }
    }
}

/// The outcome of applying one op to the replica.
#[derive(Debug)]
pub struct ApplyResult {
    pub modified: Option<StorageUpdate>,
    /// Ops that undo this one, in execution order.
    pub reverse: Vec<Op>,
}

impl ApplyResult {
    pub fn unmodified() -> Self {
        Self {
            modified: None,
            reverse: Vec::new(),
        }
    }
}

/// The arena of live CRDT nodes.
#[derive(Debug, Default)]
pub struct NodePool {
    nodes: HashMap<String, LiveNode>,
}

impl NodePool {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, id: &str) -> Option<&LiveNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut LiveNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, node: LiveNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Applies one op to the replica. Unknown targets are no-ops: an op may
    /// legitimately race with the deletion of its target.
    pub fn apply_op(&mut self, op: &Op, source: OpSource) -> ApplyResult {
        match op {
            Op::Ack { .. } => ApplyResult::unmodified(),
            Op::UpdateObject { id, data, .. } => object::apply_update(self, id, data),
            Op::DeleteObjectKey { id, key, .. } => object::apply_delete_key(self, id, key),
            Op::DeleteCrdt { id, .. } => self.apply_delete_crdt(id),
            Op::SetParentKey { id, parent_key, .. } => {
                list::apply_set_parent_key(self, id, parent_key, source)
            }
            _ => self.attach_child(op, source),
        }
    }

    /// Attaches the node a `Create*` op describes under its parent.
    fn attach_child(&mut self, op: &Op, source: OpSource) -> ApplyResult {
        let (id, parent_id, parent_key, body) = match op {
            Op::CreateObject {
                id,
                parent_id: Some(parent_id),
                parent_key: Some(parent_key),
                data,
                ..
            } => (
                id,
                parent_id,
                parent_key,
                NodeBody::Object(ObjectState::with_data(data.clone())),
            ),
            Op::CreateObject { id, .. } => {
                warn!("Ignoring CreateObject for {id} without a parent link");
                return ApplyResult::unmodified();
            }
            Op::CreateList {
                id,
                parent_id,
                parent_key,
                ..
            } => (id, parent_id, parent_key, NodeBody::List(ListState::new())),
            Op::CreateMap {
                id,
                parent_id,
                parent_key,
                ..
            } => (id, parent_id, parent_key, NodeBody::Map(MapState::new())),
            Op::CreateRegister {
                id,
                parent_id,
                parent_key,
                data,
                ..
            } => (
                id,
                parent_id,
                parent_key,
                NodeBody::Register(RegisterState { data: data.clone() }),
            ),
            _ => return ApplyResult::unmodified(),
        };

        if self.contains(id) {
            // Duplicate create (e.g. a frame replayed by the server).
            return ApplyResult::unmodified();
        }
        let Some(parent) = self.get(parent_id) else {
            return ApplyResult::unmodified();
        };

        match &parent.body {
            NodeBody::Object(_) => object::attach(self, id, parent_id, parent_key, body),
            NodeBody::Map(_) => map::attach(self, id, parent_id, parent_key, body),
            NodeBody::List(_) => list::attach(self, id, parent_id, parent_key, body, source),
            NodeBody::Register(_) => {
                warn!("Ignoring create under register node {parent_id}");
                ApplyResult::unmodified()
            }
        }
    }

    /// Deletes a node and its subtree, detaching it from its parent.
    fn apply_delete_crdt(&mut self, id: &str) -> ApplyResult {
        let Some(node) = self.get(id) else {
            return ApplyResult::unmodified();
        };
        let Some(parent_ref) = node.parent.clone() else {
            warn!("Ignoring delete of the root node {id}");
            return ApplyResult::unmodified();
        };

        let reverse = self.subtree_create_ops(id);
        let kind = match self.get_mut(&parent_ref.id).map(|p| &mut p.body) {
            Some(NodeBody::Object(state)) => {
                state.children.shift_remove(&parent_ref.key);
                StorageUpdateKind::Object {
                    updates: IndexMap::from([(parent_ref.key.clone(), ObjectDelta::Delete)]),
                }
            }
            Some(NodeBody::Map(state)) => {
                state.children.shift_remove(&parent_ref.key);
                StorageUpdateKind::Map {
                    updates: IndexMap::from([(parent_ref.key.clone(), MapDelta::Delete)]),
                }
            }
            Some(NodeBody::List(state)) => {
                let Some(index) = state.index_of(id) else {
                    return ApplyResult::unmodified();
                };
                state.children.remove(index);
                StorageUpdateKind::List {
                    updates: vec![ListDelta::Delete {
                        index,
                        id: id.to_string(),
                    }],
                }
            }
            _ => return ApplyResult::unmodified(),
        };
        self.remove_subtree(id);
        self.finish(&parent_ref.id, kind, reverse)
    }

    /// Ops that recreate a subtree, parent before children.
    pub(crate) fn subtree_create_ops(&self, id: &str) -> Vec<Op> {
        let mut ops = Vec::new();
        self.collect_create_ops(id, &mut ops);
        ops
    }

    fn collect_create_ops(&self, id: &str, out: &mut Vec<Op>) {
        let Some(node) = self.get(id) else { return };
        let Some(parent) = node.parent.clone() else {
            return;
        };
        match &node.body {
            NodeBody::Object(state) => {
                out.push(Op::CreateObject {
                    op_id: None,
                    id: id.to_string(),
                    parent_id: Some(parent.id),
                    parent_key: Some(parent.key),
                    data: state.data.clone(),
                });
                for child in state.children.values().cloned().collect::<Vec<_>>() {
                    self.collect_create_ops(&child, out);
                }
            }
            NodeBody::Map(state) => {
                out.push(Op::CreateMap {
                    op_id: None,
                    id: id.to_string(),
                    parent_id: parent.id,
                    parent_key: parent.key,
                });
                for child in state.children.values().cloned().collect::<Vec<_>>() {
                    self.collect_create_ops(&child, out);
                }
            }
            NodeBody::List(state) => {
                out.push(Op::CreateList {
                    op_id: None,
                    id: id.to_string(),
                    parent_id: parent.id,
                    parent_key: parent.key,
                });
                for entry in state.children.clone() {
                    self.collect_create_ops(&entry.child, out);
                }
            }
            NodeBody::Register(state) => {
                out.push(Op::CreateRegister {
                    op_id: None,
                    id: id.to_string(),
                    parent_id: parent.id,
                    parent_key: parent.key,
                    data: state.data.clone(),
                });
            }
        }
    }

    /// Drops `id` and every node reachable from it.
    pub(crate) fn remove_subtree(&mut self, id: &str) {
        let Some(node) = self.nodes.remove(id) else {
            return;
        };
        match node.body {
            NodeBody::Object(state) => {
                for child in state.children.values() {
                    self.remove_subtree(child);
                }
            }
            NodeBody::Map(state) => {
                for child in state.children.values() {
                    self.remove_subtree(child);
                }
            }
            NodeBody::List(state) => {
                for entry in &state.children {
                    self.remove_subtree(&entry.child);
                }
            }
            NodeBody::Register(_) => {}
        }
    }

    /// Parent chain of `id`, nearest ancestor first.
    pub fn ancestors_of(&self, id: &str) -> Vec<String> {
        let mut ancestors = Vec::new();
        let mut current = id;
        while let Some(parent) = self.get(current).and_then(|n| n.parent.as_ref()) {
            ancestors.push(parent.id.clone());
            current = &parent.id;
        }
        ancestors
    }

    /// Builds the final [`ApplyResult`] for a modification of `node_id`.
    pub(crate) fn finish(
        &self,
        node_id: &str,
        kind: StorageUpdateKind,
        reverse: Vec<Op>,
    ) -> ApplyResult {
        ApplyResult {
            modified: Some(StorageUpdate {
                node_id: node_id.to_string(),
                ancestors: self.ancestors_of(node_id),
                kind,
            }),
            reverse,
        }
    }

    /// Serializes one node back into its wire form.
    pub fn serialize_node(&self, id: &str) -> Option<SerializedCrdt> {
        let node = self.get(id)?;
        Some(match &node.body {
            NodeBody::Object(state) => SerializedCrdt::Object {
                parent: node.parent.clone(),
                data: state.data.clone(),
            },
            NodeBody::List(_) => SerializedCrdt::List {
                parent: node.parent.clone()?,
            },
            NodeBody::Map(_) => SerializedCrdt::Map {
                parent: node.parent.clone()?,
            },
            NodeBody::Register(state) => SerializedCrdt::Register {
                parent: node.parent.clone()?,
                data: state.data.clone(),
            },
        })
    }

    /// Serializes the whole pool, keyed by node id.
    pub fn serialize_all(&self) -> HashMap<String, SerializedCrdt> {
        self.nodes
            .keys()
            .filter_map(|id| Some((id.clone(), self.serialize_node(id)?)))
            .collect()
    }

    /// Renders the subtree under `id` as plain JSON: objects and maps become
    /// JSON objects, lists become arrays, registers become their value.
    pub fn render_json(&self, id: &str) -> Option<Value> {
        let node = self.get(id)?;
        Some(match &node.body {
            NodeBody::Object(state) => {
                let mut out = JsonObject::new();
                for (key, value) in &state.data {
                    out.insert(key.clone(), value.clone());
                }
                for (key, child) in &state.children {
                    out.insert(key.clone(), self.render_json(child)?);
                }
                Value::Object(out)
            }
            NodeBody::Map(state) => {
                let mut out = JsonObject::new();
                for (key, child) in &state.children {
                    out.insert(key.clone(), self.render_json(child)?);
                }
                Value::Object(out)
            }
            NodeBody::List(state) => Value::Array(
                state
                    .children
                    .iter()
                    .filter_map(|entry| self.render_json(&entry.child))
                    .collect(),
            ),
            NodeBody::Register(state) => state.data.clone(),
        })
    }
}
