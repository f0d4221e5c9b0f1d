// src/core/storage.rs

//! Storage root lifecycle and the op-application walk.
//!
//! Covers loading the root from `INITIAL_STORAGE_STATE`, diffing a fresh
//! server snapshot into an existing root after a reconnect, seeding the
//! configured initial-storage defaults, and `apply_ops`, the single path
//! every storage mutation takes through the replica.

use crate::core::crdt::{NodeBody, NodePool, OpSource, StorageUpdate, position};
use crate::core::errors::RoomError;
use crate::core::events::PendingEvents;
use crate::core::history::HistoryOp;
use crate::core::protocol::{JsonObject, Op, SerializedCrdt};
use crate::core::room::RoomCore;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// The outcome of one `apply_ops` walk.
#[derive(Debug, Default)]
pub(crate) struct AppliedOps {
    /// Storage ops that were applied locally, carrying their opIds, in
    /// production order. Empty for remote walks.
    pub executed_ops: Vec<Op>,
    /// Reverse history ops in inverse execution order.
    pub reverse: Vec<HistoryOp>,
    /// Per-node updates, coalesced, in first-touch order.
    pub updates: Vec<StorageUpdate>,
    pub presence_changed: bool,
}

impl RoomCore {
    /// Walks `ops` in order, applying each to the replica.
    ///
    /// For local walks every op gets an opId if it lacks one and applies
    /// with a reliable-local source. For remote walks the source is decided
    /// per op: an opId found in the unacknowledged ledger makes the op an
    /// ack (no replica effect beyond ledger removal), anything else is a
    /// genuinely remote op.
    pub(crate) fn apply_ops(&mut self, ops: Vec<HistoryOp>, is_local: bool) -> AppliedOps {
        let mut created: HashSet<String> = HashSet::new();
        let mut updates: Vec<StorageUpdate> = Vec::new();
        let mut out = AppliedOps::default();

        for history_op in ops {
            match history_op {
                HistoryOp::Presence { data } => {
                    let reverse = self.me.patch(&data);
                    out.reverse.insert(0, HistoryOp::Presence { data: reverse });
                    out.presence_changed = true;
                    if is_local {
                        self.buffer.merge_presence_patch(&data);
                    }
                }
                HistoryOp::Op(mut op) => {
                    if let Op::Ack { op_id } = &op {
                        self.ledger.remove(op_id);
                        continue;
                    }
                    if op.op_id().is_none() {
                        op.set_op_id(self.id_factory.generate_op_id());
                    }
                    let source = if is_local {
                        OpSource::Local
                    } else {
                        match op.op_id() {
                            Some(op_id) if self.ledger.remove(op_id).is_some() => OpSource::Ack,
                            _ => OpSource::Remote,
                        }
                    };
                    if source == OpSource::Ack {
                        // The replica already reflects our own op; the echo
                        // only cleared the ledger entry.
                        continue;
                    }

                    let result = self.pool.apply_op(&op, source);
                    if let Some(update) = result.modified {
                        if op.is_create() {
                            if let Some(id) = op.target_id() {
                                created.insert(id.to_string());
                            }
                        }
                        // A node created within this walk carries its state in
                        // the creation itself; updates for it and its subtree
                        // are folded away.
                        let suppressed = created.contains(&update.node_id)
                            || update.ancestors.iter().any(|a| created.contains(a));
                        if !suppressed {
                            merge_update(&mut updates, update);
                        }
                        let mut reverse: Vec<HistoryOp> =
                            result.reverse.into_iter().map(HistoryOp::Op).collect();
                        reverse.append(&mut out.reverse);
                        out.reverse = reverse;
                        if is_local {
                            out.executed_ops.push(op);
                        }
                    }
                }
            }
        }

        out.updates = updates;
        out
    }

    /// Handles an `INITIAL_STORAGE_STATE` message, first load or reconnect.
    pub(crate) fn handle_initial_storage(
        &mut self,
        items: Vec<(String, SerializedCrdt)>,
        pending: &mut PendingEvents,
    ) {
        if items.is_empty() {
            let err = RoomError::InvariantViolation(
                "INITIAL_STORAGE_STATE contained no items".into(),
            );
            warn!("{err}");
            pending.errors.push(err);
            return;
        }

        self.storage_requested = true;

        if self.root.is_some() {
            // Out-of-order or reconnect reload: bring the replica to the
            // server's baseline, then re-apply and resend whatever the
            // server has not acknowledged yet.
            let unacked = self.ledger.drain();
            self.update_root(&items, pending);
            if !unacked.is_empty() {
                let applied =
                    self.apply_ops(unacked.into_iter().map(HistoryOp::Op).collect(), true);
                self.record_storage_updates(applied.updates, pending);
                self.buffer.storage_ops.extend(applied.executed_ops);
            }
        } else if let Err(err) = self.load_root(&items) {
            warn!("{err}");
            pending.errors.push(err);
            return;
        }

        self.seed_initial_storage(pending);

        let root = self.root.clone();
        self.root_tx.send_replace(root);
        self.refresh_storage_status(pending);
        self.try_flush(pending);
    }

    /// First load: build the node pool from the item list and locate the
    /// unique parentless item as the root.
    fn load_root(&mut self, items: &[(String, SerializedCrdt)]) -> Result<(), RoomError> {
        let mut roots = items
            .iter()
            .filter(|(_, crdt)| crdt.parent().is_none());
        let root = match (roots.next(), roots.next()) {
            (Some((id, SerializedCrdt::Object { .. })), None) => id.clone(),
            (Some(_), None) => {
                return Err(RoomError::InvariantViolation(
                    "storage root is not an object".into(),
                ));
            }
            (None, _) => {
                return Err(RoomError::InvariantViolation(
                    "initial storage has no root item".into(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(RoomError::InvariantViolation(
                    "initial storage has more than one root item".into(),
                ));
            }
        };

        self.pool = build_pool(items);
        self.root = Some(root.clone());
        info!("Storage loaded ({} nodes, root {root})", self.pool.len());
        Ok(())
    }

    /// Reconnect reload: diff the incoming snapshot against the current
    /// replica and apply the difference as remote ops.
    fn update_root(&mut self, items: &[(String, SerializedCrdt)], pending: &mut PendingEvents) {
        let incoming: HashMap<&str, &SerializedCrdt> = items
            .iter()
            .map(|(id, crdt)| (id.as_str(), crdt))
            .collect();
        let incoming_root = items
            .iter()
            .find(|(_, crdt)| crdt.parent().is_none())
            .map(|(id, _)| id.clone());

        if incoming_root.as_deref() != self.root.as_deref() {
            // The server replaced the document wholesale; start over.
            warn!("Storage root changed on reload; rebuilding the replica");
            self.pool.clear();
            self.root = None;
            if let Err(err) = self.load_root(items) {
                warn!("{err}");
                pending.errors.push(err);
            }
            return;
        }

        let current = self.pool.serialize_all();
        let mut ops: Vec<Op> = Vec::new();

        // Deletes for nodes the server no longer has. Deleting an ancestor
        // drops the subtree; the redundant child deletes no-op.
        for id in current.keys() {
            if !incoming.contains_key(id.as_str()) {
                ops.push(Op::DeleteCrdt {
                    op_id: None,
                    id: id.clone(),
                });
            }
        }

        // Updates for nodes present on both sides with changed content.
        for (&id, &theirs) in &incoming {
            let Some(ours) = current.get(id) else { continue };
            ops.extend(diff_node(id, ours, theirs));
        }

        // Creates for server-only nodes, parents before children.
        for (id, crdt) in order_parent_first(items, &current) {
            ops.push(create_op_for(id, crdt));
        }

        let applied = self.apply_ops(ops.into_iter().map(HistoryOp::Op).collect(), false);
        self.record_storage_updates(applied.updates, pending);
    }

    /// Sets every configured initial-storage key missing from the root.
    /// Runs on every (re)load.
    fn seed_initial_storage(&mut self, pending: &mut PendingEvents) {
        let Some(root) = self.root.clone() else { return };
        let missing: JsonObject = {
            let Some(NodeBody::Object(state)) = self.pool.get(&root).map(|n| &n.body) else {
                return;
            };
            self.initial_storage
                .iter()
                .filter(|(key, _)| {
                    !state.data.contains_key(*key) && !state.children.contains_key(*key)
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        info!("Seeding {} initial storage default(s)", missing.len());
        let ops = vec![Op::UpdateObject {
            op_id: None,
            id: root,
            data: missing,
        }];
        // Defaults are not undoable and do not invalidate redo.
        let applied = self.apply_ops(ops.into_iter().map(HistoryOp::Op).collect(), true);
        self.record_storage_updates(applied.updates, pending);
        self.buffer.storage_ops.extend(applied.executed_ops);
    }

    /// Fractional position for inserting into a list at `index`; saturates
    /// to an append past the end.
    pub(crate) fn list_position(&self, list_id: &str, index: usize) -> Result<String, RoomError> {
        let Some(NodeBody::List(state)) = self.pool.get(list_id).map(|n| &n.body) else {
            return Err(RoomError::InvariantViolation(format!(
                "node {list_id} is not a list"
            )));
        };
        let before = index
            .checked_sub(1)
            .and_then(|i| state.children.get(i))
            .map(|e| e.position.as_str());
        let after = if index >= state.children.len() {
            let last = state.children.last().map(|e| e.position.as_str());
            return Ok(position::between(last, None));
        } else {
            state.children.get(index).map(|e| e.position.as_str())
        };
        Ok(position::between(before, after))
    }
}

/// Builds a pool from a serialized item list, linking children into parents.
/// Items whose parent is missing are dropped with a warning.
fn build_pool(items: &[(String, SerializedCrdt)]) -> NodePool {
    use crate::core::crdt::{ListEntry, ListState, LiveNode, MapState, ObjectState, RegisterState};

    let mut pool = NodePool::new();
    let ids: HashSet<&str> = items.iter().map(|(id, _)| id.as_str()).collect();

    for (id, crdt) in items {
        if let Some(parent) = crdt.parent() {
            if !ids.contains(parent.id.as_str()) {
                warn!("Dropping storage item {id}: parent {} is unknown", parent.id);
                continue;
            }
        }
        let body = match crdt {
            SerializedCrdt::Object { data, .. } => NodeBody::Object(ObjectState::with_data(data.clone())),
            SerializedCrdt::List { .. } => NodeBody::List(ListState::new()),
            SerializedCrdt::Map { .. } => NodeBody::Map(MapState::new()),
            SerializedCrdt::Register { data, .. } => {
                NodeBody::Register(RegisterState { data: data.clone() })
            }
        };
        pool.insert(LiveNode {
            id: id.clone(),
            parent: crdt.parent().cloned(),
            body,
        });
    }

    // Second pass: wire child links now that every node exists.
    for (id, crdt) in items {
        let Some(parent) = crdt.parent() else { continue };
        if !pool.contains(id) {
            continue;
        }
        match pool.get_mut(&parent.id).map(|n| &mut n.body) {
            Some(NodeBody::Object(state)) => {
                state.children.insert(parent.key.clone(), id.clone());
            }
            Some(NodeBody::Map(state)) => {
                state.children.insert(parent.key.clone(), id.clone());
            }
            Some(NodeBody::List(state)) => {
                let index = state.insertion_index(&parent.key);
                state.children.insert(
                    index,
                    ListEntry {
                        position: parent.key.clone(),
                        child: id.clone(),
                    },
                );
            }
            _ => warn!("Dropping storage item {id}: parent {} cannot hold children", parent.id),
        }
    }
    pool
}

/// Ops that reconcile one node present on both sides.
fn diff_node(id: &str, ours: &SerializedCrdt, theirs: &SerializedCrdt) -> Vec<Op> {
    let mut ops = Vec::new();
    match (ours, theirs) {
        (
            SerializedCrdt::Object { data: our_data, .. },
            SerializedCrdt::Object { data: their_data, .. },
        ) => {
            let mut changed = JsonObject::new();
            for (key, value) in their_data {
                if our_data.get(key) != Some(value) {
                    changed.insert(key.clone(), value.clone());
                }
            }
            if !changed.is_empty() {
                ops.push(Op::UpdateObject {
                    op_id: None,
                    id: id.to_string(),
                    data: changed,
                });
            }
            for key in our_data.keys() {
                if !their_data.contains_key(key) {
                    ops.push(Op::DeleteObjectKey {
                        op_id: None,
                        id: id.to_string(),
                        key: key.clone(),
                    });
                }
            }
        }
        (
            SerializedCrdt::Register { data: our_data, .. },
            SerializedCrdt::Register { .. },
        ) if ours.parent() == theirs.parent() => {
            if Some(our_data) != register_data(theirs) {
                ops.push(Op::DeleteCrdt {
                    op_id: None,
                    id: id.to_string(),
                });
                ops.push(create_op_for(id, theirs));
            }
        }
        _ => {}
    }

    // A changed parent link: a move within a list, or a reparent.
    match (ours.parent(), theirs.parent()) {
        (Some(ours_parent), Some(theirs_parent)) if ours_parent != theirs_parent => {
            if ours_parent.id == theirs_parent.id {
                ops.push(Op::SetParentKey {
                    op_id: None,
                    id: id.to_string(),
                    parent_key: theirs_parent.key.clone(),
                });
            } else {
                ops.push(Op::DeleteCrdt {
                    op_id: None,
                    id: id.to_string(),
                });
                ops.push(create_op_for(id, theirs));
            }
        }
        _ => {}
    }
    ops
}

fn register_data(crdt: &SerializedCrdt) -> Option<&Value> {
    match crdt {
        SerializedCrdt::Register { data, .. } => Some(data),
        _ => None,
    }
}

/// The create op reproducing one serialized node.
fn create_op_for(id: &str, crdt: &SerializedCrdt) -> Op {
    match crdt {
        SerializedCrdt::Object { parent, data } => Op::CreateObject {
            op_id: None,
            id: id.to_string(),
            parent_id: parent.as_ref().map(|p| p.id.clone()),
            parent_key: parent.as_ref().map(|p| p.key.clone()),
            data: data.clone(),
        },
        SerializedCrdt::List { parent } => Op::CreateList {
            op_id: None,
            id: id.to_string(),
            parent_id: parent.id.clone(),
            parent_key: parent.key.clone(),
        },
        SerializedCrdt::Map { parent } => Op::CreateMap {
            op_id: None,
            id: id.to_string(),
            parent_id: parent.id.clone(),
            parent_key: parent.key.clone(),
        },
        SerializedCrdt::Register { parent, data } => Op::CreateRegister {
            op_id: None,
            id: id.to_string(),
            parent_id: parent.id.clone(),
            parent_key: parent.key.clone(),
            data: data.clone(),
        },
    }
}

/// Incoming-only items ordered so that parents precede their children.
fn order_parent_first<'a>(
    items: &'a [(String, SerializedCrdt)],
    current: &HashMap<String, SerializedCrdt>,
) -> Vec<(&'a str, &'a SerializedCrdt)> {
    let mut remaining: Vec<(&str, &SerializedCrdt)> = items
        .iter()
        .filter(|(id, _)| !current.contains_key(id.as_str()))
        .map(|(id, crdt)| (id.as_str(), crdt))
        .collect();
    let mut placed: HashSet<&str> = current.keys().map(String::as_str).collect();
    let mut ordered = Vec::with_capacity(remaining.len());

    // Repeatedly take items whose parent is already placed. The item list is
    // small; quadratic worst case is fine.
    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|&(id, crdt)| match crdt.parent() {
            Some(parent) if placed.contains(parent.id.as_str()) => {
                placed.insert(id);
                ordered.push((id, crdt));
                false
            }
            None => {
                placed.insert(id);
                ordered.push((id, crdt));
                false
            }
            Some(_) => true,
        });
        if remaining.len() == before {
            for (id, _) in &remaining {
                warn!("Dropping incoming storage item {id}: unresolvable parent");
            }
            break;
        }
    }
    ordered
}

/// Merges an update into the per-node accumulator, preserving first-touch
/// order.
fn merge_update(updates: &mut Vec<StorageUpdate>, update: StorageUpdate) {
    match updates.iter_mut().find(|u| u.node_id == update.node_id) {
        Some(existing) => existing.merge(update),
        None => updates.push(update),
    }
}
