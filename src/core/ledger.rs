// src/core/ledger.rs

//! Bookkeeping for ops sent but not yet confirmed by the server.
//!
//! An op leaves the ledger when its echo comes back, either as an `Ack` or as
//! the same opId inside a remote `UPDATE_STORAGE` broadcast. Whatever is
//! still in the ledger after a reconnect is resent wholesale.

use crate::core::protocol::Op;
use indexmap::IndexMap;
use tracing::debug;

/// Map from opId to op, in production order.
#[derive(Debug, Default)]
pub struct UnackLedger {
    ops: IndexMap<String, Op>,
}

impl UnackLedger {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records an op awaiting confirmation. Re-inserting the same opId (a
    /// throttled flush retried) just refreshes the entry.
    pub fn insert(&mut self, op: Op) {
        match op.op_id() {
            Some(op_id) => {
                self.ops.insert(op_id.to_string(), op);
            }
            None => debug!("Refusing to track an op without an opId"),
        }
    }

    /// Confirms an op. Returns it when the opId was ours, which is how apply
    /// distinguishes an ack echo from a genuinely remote op.
    pub fn remove(&mut self, op_id: &str) -> Option<Op> {
        self.ops.shift_remove(op_id)
    }

    pub fn contains(&self, op_id: &str) -> bool {
        self.ops.contains_key(op_id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Takes every tracked op, oldest first, for the post-reconnect resend.
    pub fn drain(&mut self) -> Vec<Op> {
        self.ops.drain(..).map(|(_, op)| op).collect()
    }
}
