// src/core/crdt/object.rs

//! The keyed-object node: plain JSON fields plus nested nodes under keys.

use super::{ApplyResult, NodeBody, NodePool, StorageUpdateKind};
use crate::core::protocol::{JsonObject, Op, ParentRef};
use indexmap::IndexMap;
use tracing::warn;

/// Content of an object node. Plain JSON fields live in `data`; nested nodes
/// are linked by key in `children`. A key holds either a JSON field or a
/// child node, never both.
#[derive(Debug, Clone, Default)]
pub struct ObjectState {
    pub data: JsonObject,
    pub children: IndexMap<String, String>,
}

impl ObjectState {
    pub fn with_data(data: JsonObject) -> Self {
        Self {
            data,
            children: IndexMap::new(),
        }
    }
}

/// Per-key change descriptor for object updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectDelta {
    Update,
    Delete,
}

/// Applies an `UpdateObject` op: shallow-merges `data` into the target.
/// A key currently holding a child node is clobbered, subtree included.
pub(super) fn apply_update(pool: &mut NodePool, id: &str, data: &JsonObject) -> ApplyResult {
    match pool.get(id).map(|n| &n.body) {
        Some(NodeBody::Object(_)) => {}
        Some(_) => {
            warn!("Ignoring UpdateObject targeting non-object node {id}");
            return ApplyResult::unmodified();
        }
        None => return ApplyResult::unmodified(),
    }

    let mut old_values = JsonObject::new();
    let mut added_keys: Vec<String> = Vec::new();
    let mut clobbered_children: Vec<Op> = Vec::new();
    let mut updates = IndexMap::with_capacity(data.len());

    for (key, value) in data {
        let clobbered = child_at(pool, id, key);
        if let Some(child) = clobbered.as_deref() {
            clobbered_children.extend(pool.subtree_create_ops(child));
            pool.remove_subtree(child);
        }

        let Some(NodeBody::Object(state)) = pool.get_mut(id).map(|n| &mut n.body) else {
            unreachable!("node kind checked above");
        };
        if clobbered.is_some() {
            state.children.shift_remove(key);
        }
        match state.data.insert(key.clone(), value.clone()) {
            Some(old) => {
                old_values.insert(key.clone(), old);
            }
            None if clobbered.is_none() => added_keys.push(key.clone()),
            None => {}
        }
        updates.insert(key.clone(), ObjectDelta::Update);
    }

    let mut reverse = Vec::new();
    if !old_values.is_empty() {
        reverse.push(Op::UpdateObject {
            op_id: None,
            id: id.to_string(),
            data: old_values,
        });
    }
    for key in added_keys {
        reverse.push(Op::DeleteObjectKey {
            op_id: None,
            id: id.to_string(),
            key,
        });
    }
    reverse.extend(clobbered_children);

    pool.finish(id, StorageUpdateKind::Object { updates }, reverse)
}

/// Applies a `DeleteObjectKey` op, removing a JSON field or a child subtree.
pub(super) fn apply_delete_key(pool: &mut NodePool, id: &str, key: &str) -> ApplyResult {
    match pool.get(id).map(|n| &n.body) {
        Some(NodeBody::Object(_)) => {}
        Some(_) => {
            warn!("Ignoring DeleteObjectKey targeting non-object node {id}");
            return ApplyResult::unmodified();
        }
        None => return ApplyResult::unmodified(),
    }

    let reverse;
    if let Some(child) = child_at(pool, id, key) {
        reverse = pool.subtree_create_ops(&child);
        pool.remove_subtree(&child);
        let Some(NodeBody::Object(state)) = pool.get_mut(id).map(|n| &mut n.body) else {
            unreachable!("node kind checked above");
        };
        state.children.shift_remove(key);
    } else {
        let Some(NodeBody::Object(state)) = pool.get_mut(id).map(|n| &mut n.body) else {
            unreachable!("node kind checked above");
        };
        match state.data.shift_remove(key) {
            Some(old) => {
                let mut old_data = JsonObject::new();
                old_data.insert(key.to_string(), old);
                reverse = vec![Op::UpdateObject {
                    op_id: None,
                    id: id.to_string(),
                    data: old_data,
                }];
            }
            None => return ApplyResult::unmodified(),
        }
    }

    pool.finish(
        id,
        StorageUpdateKind::Object {
            updates: IndexMap::from([(key.to_string(), ObjectDelta::Delete)]),
        },
        reverse,
    )
}

/// Attaches a freshly created node under an object parent. An occupied key is
/// clobbered; the reverse ops restore whatever was there.
pub(super) fn attach(
    pool: &mut NodePool,
    id: &str,
    parent_id: &str,
    parent_key: &str,
    body: NodeBody,
) -> ApplyResult {
    let mut reverse = vec![Op::DeleteCrdt {
        op_id: None,
        id: id.to_string(),
    }];

    if let Some(existing) = child_at(pool, parent_id, parent_key) {
        reverse.extend(pool.subtree_create_ops(&existing));
        pool.remove_subtree(&existing);
    }

    let Some(NodeBody::Object(state)) = pool.get_mut(parent_id).map(|n| &mut n.body) else {
        return ApplyResult::unmodified();
    };
    if let Some(old) = state.data.shift_remove(parent_key) {
        let mut old_data = JsonObject::new();
        old_data.insert(parent_key.to_string(), old);
        reverse.push(Op::UpdateObject {
            op_id: None,
            id: parent_id.to_string(),
            data: old_data,
        });
    }
    state
        .children
        .insert(parent_key.to_string(), id.to_string());

    pool.insert(super::LiveNode {
        id: id.to_string(),
        parent: Some(ParentRef {
            id: parent_id.to_string(),
            key: parent_key.to_string(),
        }),
        body,
    });

    pool.finish(
        parent_id,
        StorageUpdateKind::Object {
            updates: IndexMap::from([(parent_key.to_string(), ObjectDelta::Update)]),
        },
        reverse,
    )
}

fn child_at(pool: &NodePool, id: &str, key: &str) -> Option<String> {
    match pool.get(id).map(|n| &n.body) {
        Some(NodeBody::Object(state)) => state.children.get(key).cloned(),
        _ => None,
    }
}
