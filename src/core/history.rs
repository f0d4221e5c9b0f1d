// src/core/history.rs

//! Undo/redo stacks, the paused-history buffer, and the active-batch
//! accumulator.
//!
//! History entries are *batches*: lists of reverse ops executed as one
//! undoable unit. Reverse ops are always prepended while a batch runs, so a
//! batch replays newest-first when undone.

use crate::core::crdt::StorageUpdate;
use crate::core::events::{HistoryStatus, OthersEvent};
use crate::core::protocol::{JsonObject, Op};
use indexmap::IndexMap;
use std::collections::VecDeque;

/// Maximum number of undoable batches kept; the oldest is dropped on
/// overflow.
pub const MAX_HISTORY_DEPTH: usize = 50;

/// One entry in a history batch: a storage op or a presence delta.
#[derive(Debug, Clone)]
pub enum HistoryOp {
    Op(Op),
    Presence { data: JsonObject },
}

/// Accumulator for an open `batch()` scope. Ops apply to the replica
/// immediately; everything the outside world sees (wire frames, history,
/// events) is held here until the outermost batch completes.
#[derive(Debug, Default)]
pub struct ActiveBatch {
    /// Executed ops carrying their assigned opIds, in production order.
    pub ops: Vec<Op>,
    /// Reverse ops in inverse execution order.
    pub reverse_ops: Vec<HistoryOp>,
    /// Per-node updates, coalesced.
    pub storage_updates: IndexMap<String, StorageUpdate>,
    /// Whether the local presence changed during the batch.
    pub presence: bool,
    /// The merged outbound presence patch to queue at commit.
    pub presence_patch: Option<JsonObject>,
    /// Others events received mid-batch, deferred to commit.
    pub others: Vec<OthersEvent>,
}

impl ActiveBatch {
    pub fn merge_storage_updates(&mut self, updates: impl IntoIterator<Item = StorageUpdate>) {
        for update in updates {
            match self.storage_updates.get_mut(&update.node_id) {
                Some(existing) => existing.merge(update),
                None => {
                    self.storage_updates.insert(update.node_id.clone(), update);
                }
            }
        }
    }
}

/// The undo/redo stacks plus the paused-history buffer.
#[derive(Debug, Default)]
pub struct HistoryState {
    undo: VecDeque<Vec<HistoryOp>>,
    redo: VecDeque<Vec<HistoryOp>>,
    paused: Option<Vec<HistoryOp>>,
}

impl HistoryState {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records a reverse-op batch. While history is paused the batch is
    /// prepended to the paused buffer instead, so the whole pause coalesces
    /// into one undoable unit on resume.
    pub fn push_undo(&mut self, batch: Vec<HistoryOp>) {
        if batch.is_empty() {
            return;
        }
        match &mut self.paused {
            Some(buffer) => {
                let mut merged = batch;
                merged.append(buffer);
                *buffer = merged;
            }
            None => push_bounded(&mut self.undo, batch),
        }
    }

    pub fn pop_undo(&mut self) -> Option<Vec<HistoryOp>> {
        self.undo.pop_back()
    }

    pub fn push_redo(&mut self, batch: Vec<HistoryOp>) {
        if !batch.is_empty() {
            push_bounded(&mut self.redo, batch);
        }
    }

    pub fn pop_redo(&mut self) -> Option<Vec<HistoryOp>> {
        self.redo.pop_back()
    }

    /// Any successful local storage op outside undo/redo invalidates the
    /// redo stack.
    pub fn clear_redo(&mut self) {
        self.redo.clear();
    }

    pub fn pause(&mut self) {
        if self.paused.is_none() {
            self.paused = Some(Vec::new());
        }
    }

    pub fn resume(&mut self) {
        if let Some(buffer) = self.paused.take() {
            if !buffer.is_empty() {
                push_bounded(&mut self.undo, buffer);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn status(&self) -> HistoryStatus {
        HistoryStatus {
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
        }
    }
}

fn push_bounded(stack: &mut VecDeque<Vec<HistoryOp>>, batch: Vec<HistoryOp>) {
    stack.push_back(batch);
    if stack.len() > MAX_HISTORY_DEPTH {
        stack.pop_front();
    }
}
