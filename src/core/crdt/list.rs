// src/core/crdt/list.rs

//! The ordered-sequence node. Children are keyed by fractional positions;
//! the entry vector is kept sorted by position at all times.

use super::{ApplyResult, NodeBody, NodePool, OpSource, StorageUpdateKind, position};
use crate::core::protocol::{Op, ParentRef};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub position: String,
    pub child: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListState {
    pub children: Vec<ListEntry>,
}

impl ListState {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn index_of(&self, child_id: &str) -> Option<usize> {
        self.children.iter().position(|e| e.child == child_id)
    }

    /// Index at which `pos` sorts, i.e. the first entry with `position >= pos`.
    pub fn insertion_index(&self, pos: &str) -> usize {
        self.children.partition_point(|e| e.position.as_str() < pos)
    }

    /// The id of the entry sitting exactly at `pos`, if any.
    pub fn occupant_at(&self, pos: &str) -> Option<&ListEntry> {
        self.children
            .get(self.insertion_index(pos))
            .filter(|e| e.position == pos)
    }
}

/// Index-tagged change descriptor for list updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListDelta {
    Insert { index: usize, id: String },
    Move { index: usize, id: String },
    Delete { index: usize, id: String },
}

/// Attaches a freshly created node into a list parent at the position given
/// by its parent key. When another child already sits at that position, the
/// incomer wins the slot and the occupant is shifted to a fresh position
/// right after it; every replica applies the same rule, so order converges.
pub(super) fn attach(
    pool: &mut NodePool,
    id: &str,
    parent_id: &str,
    pos: &str,
    body: NodeBody,
    _source: OpSource,
) -> ApplyResult {
    let reverse = vec![Op::DeleteCrdt {
        op_id: None,
        id: id.to_string(),
    }];
    let mut updates = Vec::with_capacity(2);

    let shifted = shift_occupant(pool, parent_id, pos);

    let Some(NodeBody::List(state)) = pool.get_mut(parent_id).map(|n| &mut n.body) else {
        return ApplyResult::unmodified();
    };
    let index = state.insertion_index(pos);
    state.children.insert(
        index,
        ListEntry {
            position: pos.to_string(),
            child: id.to_string(),
        },
    );
    updates.push(ListDelta::Insert {
        index,
        id: id.to_string(),
    });
    if let Some(other) = shifted {
        updates.push(ListDelta::Move {
            index: index + 1,
            id: other,
        });
    }

    pool.insert(super::LiveNode {
        id: id.to_string(),
        parent: Some(ParentRef {
            id: parent_id.to_string(),
            key: pos.to_string(),
        }),
        body,
    });

    pool.finish(parent_id, StorageUpdateKind::List { updates }, reverse)
}

/// Applies a `SetParentKey` op: moves a child to a new position within its
/// list parent. Targets without a list parent are no-ops.
pub(super) fn apply_set_parent_key(
    pool: &mut NodePool,
    id: &str,
    new_pos: &str,
    _source: OpSource,
) -> ApplyResult {
    let Some(parent_ref) = pool.get(id).and_then(|n| n.parent.clone()) else {
        return ApplyResult::unmodified();
    };
    match pool.get(&parent_ref.id).map(|n| &n.body) {
        Some(NodeBody::List(_)) => {}
        Some(_) => {
            warn!("Ignoring SetParentKey for {id}: parent is not a list");
            return ApplyResult::unmodified();
        }
        None => return ApplyResult::unmodified(),
    }

    let old_pos = parent_ref.key.clone();
    if old_pos == new_pos {
        return ApplyResult::unmodified();
    }

    // Detach the moving entry first so the occupant shift cannot collide
    // with it.
    {
        let Some(NodeBody::List(state)) = pool.get_mut(&parent_ref.id).map(|n| &mut n.body) else {
            return ApplyResult::unmodified();
        };
        let Some(index) = state.index_of(id) else {
            return ApplyResult::unmodified();
        };
        state.children.remove(index);
    }

    let shifted = shift_occupant(pool, &parent_ref.id, new_pos);

    let Some(NodeBody::List(state)) = pool.get_mut(&parent_ref.id).map(|n| &mut n.body) else {
        return ApplyResult::unmodified();
    };
    let index = state.insertion_index(new_pos);
    state.children.insert(
        index,
        ListEntry {
            position: new_pos.to_string(),
            child: id.to_string(),
        },
    );

    let mut updates = vec![ListDelta::Move {
        index,
        id: id.to_string(),
    }];
    if let Some(other) = shifted {
        updates.push(ListDelta::Move {
            index: index + 1,
            id: other,
        });
    }

    if let Some(node) = pool.get_mut(id) {
        node.parent = Some(ParentRef {
            id: parent_ref.id.clone(),
            key: new_pos.to_string(),
        });
    }

    let reverse = vec![Op::SetParentKey {
        op_id: None,
        id: id.to_string(),
        parent_key: old_pos,
    }];
    pool.finish(&parent_ref.id, StorageUpdateKind::List { updates }, reverse)
}

/// If a child of `parent_id` sits exactly at `pos`, move it to a fresh
/// position just after `pos` (still before the next entry). Returns the
/// shifted child's id.
fn shift_occupant(pool: &mut NodePool, parent_id: &str, pos: &str) -> Option<String> {
    let (other_id, new_other_pos) = {
        let Some(NodeBody::List(state)) = pool.get(parent_id).map(|n| &n.body) else {
            return None;
        };
        let occupant = state.occupant_at(pos)?;
        let occupant_index = state.insertion_index(pos);
        let next = state
            .children
            .get(occupant_index + 1)
            .map(|e| e.position.as_str());
        (
            occupant.child.clone(),
            position::between(Some(pos), next),
        )
    };

    if let Some(NodeBody::List(state)) = pool.get_mut(parent_id).map(|n| &mut n.body) {
        if let Some(index) = state.index_of(&other_id) {
            state.children[index].position = new_other_pos.clone();
        }
    }
    if let Some(node) = pool.get_mut(&other_id) {
        if let Some(parent) = node.parent.as_mut() {
            parent.key = new_other_pos;
        }
    }
    Some(other_id)
}
