// src/core/crdt/map.rs

//! The keyed-map node. Every entry is a child node (plain values are
//! register children), so the map itself carries no inline data.

use super::{ApplyResult, NodeBody, NodePool, StorageUpdateKind};
use crate::core::protocol::{Op, ParentRef};
use indexmap::IndexMap;

#[derive(Debug, Clone, Default)]
pub struct MapState {
    pub children: IndexMap<String, String>,
}

impl MapState {
    pub fn new() -> Self {
        Default::default()
    }
}

/// Per-key change descriptor for map updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapDelta {
    Update,
    Delete,
}

/// Attaches a freshly created node under a map parent. An occupied key is
/// clobbered; the reverse ops restore the previous entry.
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

    let existing = match pool.get(parent_id).map(|n| &n.body) {
        Some(NodeBody::Map(state)) => state.children.get(parent_key).cloned(),
        _ => return ApplyResult::unmodified(),
    };
    if let Some(existing) = existing.as_deref() {
        reverse.extend(pool.subtree_create_ops(existing));
        pool.remove_subtree(existing);
    }

    let Some(NodeBody::Map(state)) = pool.get_mut(parent_id).map(|n| &mut n.body) else {
        return ApplyResult::unmodified();
    };
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
        StorageUpdateKind::Map {
            updates: IndexMap::from([(parent_key.to_string(), MapDelta::Update)]),
        },
        reverse,
    )
}
