// src/core/ids.rs

//! Monotonic id factory producing per-connection unique ids for nodes and ops.
//!
//! Ids have the form `"<actor>:<counter>"`. Node ids and op ids draw from
//! separate counters. The counters never reset within a room's lifetime, so
//! ids stay unique even when a reconnect assigns a new actor.

/// Produces node ids and op ids for everything this client creates.
#[derive(Debug)]
pub struct IdFactory {
    actor: i32,
    next_node: u64,
    next_op: u64,
}

impl IdFactory {
    pub fn new(actor: i32) -> Self {
        Self {
            actor,
            next_node: 0,
            next_op: 0,
        }
    }

    /// Adopts the actor assigned by a fresh token. Counters keep increasing.
    pub fn rebase(&mut self, actor: i32) {
        self.actor = actor;
    }

    pub fn actor(&self) -> i32 {
        self.actor
    }

    pub fn generate_node_id(&mut self) -> String {
        let n = self.next_node;
        self.next_node += 1;
        format!("{}:{}", self.actor, n)
    }

    pub fn generate_op_id(&mut self) -> String {
        let n = self.next_op;
        self.next_op += 1;
        format!("{}:{}", self.actor, n)
    }
}
