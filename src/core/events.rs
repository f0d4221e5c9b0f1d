// src/core/events.rs

//! The observable event bus: one broadcast channel per named event, plus
//! node-scoped storage subscriptions with shallow/deep filtering.
//!
//! Emission groups produced by a single mutation or inbound frame are
//! dispatched together, bracketed by the host-supplied `batch_updates`
//! wrapper so downstream UI frameworks can coalesce renders.

use crate::core::crdt::StorageUpdate;
use crate::core::errors::RoomError;
use crate::core::presence::User;
use crate::core::protocol::JsonObject;
use crate::core::room::{ConnectionStatus, StorageStatus};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, Receiver, Sender};

/// The capacity of each individual event channel.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// A change event on the others collection, carrying the full visible
/// snapshot alongside what happened.
#[derive(Debug, Clone)]
pub struct OthersEvent {
    pub kind: OthersEventKind,
    pub others: Vec<User>,
}

#[derive(Debug, Clone)]
pub enum OthersEventKind {
    /// The collection was rebuilt wholesale (room state sync or disconnect).
    Reset,
    Enter { user: User },
    Leave { user: User },
    Update { user: User, patch: JsonObject },
}

/// An application-level event broadcast by a peer.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    pub connection_id: i32,
    pub event: Value,
}

/// Undo/redo availability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryStatus {
    pub can_undo: bool,
    pub can_redo: bool,
}

/// Host-supplied wrapper invoked around every emission group. Defaults to a
/// pass-through.
pub type BatchUpdatesFn = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

pub fn passthrough_batch_updates() -> BatchUpdatesFn {
    Arc::new(|emit| emit())
}

/// Scope of a node subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDepth {
    /// Updates on the node itself only.
    Shallow,
    /// Updates on the node or anything in its subtree.
    Deep,
}

/// A filtered view over the storage channel, scoped to one node.
pub struct NodeSubscription {
    node_id: String,
    depth: SubscriptionDepth,
    rx: Receiver<Arc<Vec<StorageUpdate>>>,
}

impl NodeSubscription {
    /// Waits for the next batch containing at least one matching update and
    /// returns the matching subset.
    pub async fn recv(&mut self) -> Result<Vec<StorageUpdate>, broadcast::error::RecvError> {
        loop {
            let batch = self.rx.recv().await?;
            let matching: Vec<StorageUpdate> = batch
                .iter()
                .filter(|update| self.matches(update))
                .cloned()
                .collect();
            if !matching.is_empty() {
                return Ok(matching);
            }
        }
    }

    fn matches(&self, update: &StorageUpdate) -> bool {
        if update.node_id == self.node_id {
            return true;
        }
        match self.depth {
            SubscriptionDepth::Shallow => false,
            SubscriptionDepth::Deep => update.ancestors.iter().any(|a| *a == self.node_id),
        }
    }
}

/// Everything one mutation or inbound frame wants to tell the host,
/// accumulated while the room lock is held and dispatched afterwards.
#[derive(Default)]
pub(crate) struct PendingEvents {
    pub errors: Vec<RoomError>,
    pub connection: Option<ConnectionStatus>,
    pub storage_status: Option<StorageStatus>,
    pub my_presence: Option<JsonObject>,
    pub others: Vec<OthersEvent>,
    pub custom: Vec<CustomEvent>,
    pub storage: Vec<StorageUpdate>,
    pub history: Option<HistoryStatus>,
}

impl PendingEvents {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
            && self.connection.is_none()
            && self.storage_status.is_none()
            && self.my_presence.is_none()
            && self.others.is_empty()
            && self.custom.is_empty()
            && self.storage.is_empty()
            && self.history.is_none()
    }

    /// Coalesces node updates so observers see one merged update per node.
    pub fn merge_storage_updates(&mut self, updates: impl IntoIterator<Item = StorageUpdate>) {
        for update in updates {
            match self.storage.iter_mut().find(|u| u.node_id == update.node_id) {
                Some(existing) => existing.merge(update),
                None => self.storage.push(update),
            }
        }
    }
}

/// The event bus. Subscribing returns a `broadcast::Receiver`; dropping the
/// receiver unsubscribes. When the room is disconnected the bus is replaced
/// by a closed one, so every live receiver observes channel closure.
pub struct RoomEvents {
    closed: bool,
    batch_updates: BatchUpdatesFn,
    error: Sender<RoomError>,
    connection: Sender<ConnectionStatus>,
    storage_status: Sender<StorageStatus>,
    my_presence: Sender<JsonObject>,
    others: Sender<OthersEvent>,
    custom: Sender<CustomEvent>,
    storage: Sender<Arc<Vec<StorageUpdate>>>,
    history: Sender<HistoryStatus>,
}

impl RoomEvents {
    pub fn new(batch_updates: BatchUpdatesFn) -> Self {
        Self {
            closed: false,
            batch_updates,
            error: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            connection: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            storage_status: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            my_presence: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            others: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            custom: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            storage: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            history: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    /// A bus whose subscriptions never yield; swapped in on disconnect.
    pub fn closed(batch_updates: BatchUpdatesFn) -> Self {
        Self {
            closed: true,
            ..Self::new(batch_updates)
        }
    }

    pub fn subscribe_error(&self) -> Receiver<RoomError> {
        self.error.subscribe()
    }

    pub fn subscribe_connection(&self) -> Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub fn subscribe_storage_status(&self) -> Receiver<StorageStatus> {
        self.storage_status.subscribe()
    }

    pub fn subscribe_my_presence(&self) -> Receiver<JsonObject> {
        self.my_presence.subscribe()
    }

    pub fn subscribe_others(&self) -> Receiver<OthersEvent> {
        self.others.subscribe()
    }

    pub fn subscribe_custom(&self) -> Receiver<CustomEvent> {
        self.custom.subscribe()
    }

    pub fn subscribe_storage(&self) -> Receiver<Arc<Vec<StorageUpdate>>> {
        self.storage.subscribe()
    }

    pub fn subscribe_history(&self) -> Receiver<HistoryStatus> {
        self.history.subscribe()
    }

    pub fn subscribe_node(&self, node_id: &str, depth: SubscriptionDepth) -> NodeSubscription {
        NodeSubscription {
            node_id: node_id.to_string(),
            depth,
            rx: self.storage.subscribe(),
        }
    }

    /// Emits one group of related events inside the `batch_updates` wrapper.
    /// Sends to channels without receivers are fine and ignored.
    pub(crate) fn dispatch(&self, pending: PendingEvents) {
        if self.closed || pending.is_empty() {
            return;
        }
        let storage_batch = if pending.storage.is_empty() {
            None
        } else {
            Some(Arc::new(pending.storage.clone()))
        };
        (self.batch_updates)(&mut || {
            for error in &pending.errors {
                let _ = self.error.send(error.clone());
            }
            if let Some(status) = pending.connection {
                let _ = self.connection.send(status);
            }
            if let Some(status) = pending.storage_status {
                let _ = self.storage_status.send(status);
            }
            if let Some(me) = &pending.my_presence {
                let _ = self.my_presence.send(me.clone());
            }
            for event in &pending.others {
                let _ = self.others.send(event.clone());
            }
            for event in &pending.custom {
                let _ = self.custom.send(event.clone());
            }
            if let Some(batch) = &storage_batch {
                let _ = self.storage.send(batch.clone());
            }
            if let Some(status) = pending.history {
                let _ = self.history.send(status);
            }
        });
    }
}
