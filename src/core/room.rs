// src/core/room.rs

//! The room core and its public facade.
//!
//! `RoomCore` owns every piece of mutable room state and is guarded by one
//! mutex; host calls, the connection worker and timer tasks all serialize
//! through it. Events produced while the lock is held are collected into a
//! [`PendingEvents`] group and dispatched after release, so host callbacks
//! never run under the lock.

use crate::auth::token::scopes_imply_read_only;
use crate::config::RoomConfig;
use crate::connection::machine::ConnectionWorker;
use crate::core::crdt::{NodePool, StorageUpdate};
use crate::core::errors::RoomError;
use crate::core::events::{
    BatchUpdatesFn, CustomEvent, HistoryStatus, NodeSubscription, OthersEvent, OthersEventKind,
    PendingEvents, RoomEvents, SubscriptionDepth,
};
use crate::core::flush::OutboundBuffer;
use crate::core::history::{ActiveBatch, HistoryOp, HistoryState};
use crate::core::ids::IdFactory;
use crate::core::ledger::UnackLedger;
use crate::core::presence::{ConnectionMeta, MyPresence, Others, User};
use crate::core::protocol::{
    ClientMessage, JsonObject, Op, SerializedCrdt, ServerMessage, parse_frame,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info};

pub use crate::core::protocol::BROADCAST_ALL as BROADCAST_KEYFRAME;

/// What the current token said about us, carried by the self-aware
/// connection states.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub actor: i32,
    pub user_id: Option<String>,
    pub user_info: Option<Value>,
    pub is_read_only: bool,
}

/// The connection state machine's state.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Connection {
    #[default]
    Closed,
    Authenticating,
    Connecting(SessionInfo),
    Open(SessionInfo),
    Unavailable,
    Failed,
}

impl Connection {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Connection::Closed => ConnectionStatus::Closed,
            Connection::Authenticating => ConnectionStatus::Authenticating,
            Connection::Connecting(_) => ConnectionStatus::Connecting,
            Connection::Open(_) => ConnectionStatus::Open,
            Connection::Unavailable => ConnectionStatus::Unavailable,
            Connection::Failed => ConnectionStatus::Failed,
        }
    }

    /// `Some` iff the session knows who it is (connecting or open).
    pub fn session(&self) -> Option<&SessionInfo> {
        match self {
            Connection::Connecting(session) | Connection::Open(session) => Some(session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ConnectionStatus {
    Closed,
    Authenticating,
    Connecting,
    Open,
    Unavailable,
    Failed,
}

/// Derived, four-valued storage lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum StorageStatus {
    #[default]
    NotLoaded,
    Loading,
    Synchronizing,
    Synchronized,
}

/// State shared between the facade, the connection worker and timer tasks.
pub(crate) struct RoomShared {
    pub(crate) config: RoomConfig,
    pub(crate) core: Mutex<RoomCore>,
    pub(crate) events: RwLock<RoomEvents>,
    pub(crate) batch_updates: BatchUpdatesFn,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    pub(crate) reconnect_tx: broadcast::Sender<()>,
    /// Captured at `enter` so timers can be armed from host threads that
    /// live outside the runtime.
    pub(crate) runtime: tokio::runtime::Handle,
}

impl RoomShared {
    /// Runs `f` under the core lock, then dispatches whatever events it
    /// produced. Host callbacks therefore never run while the lock is held.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut RoomCore, &mut PendingEvents) -> R) -> R {
        let mut pending = PendingEvents::default();
        let result = {
            let mut core = self.core.lock();
            f(&mut core, &mut pending)
        };
        self.events.read().dispatch(pending);
        result
    }

    /// Entry point for the one-shot flush timer.
    pub(crate) fn flush_tick(&self) {
        self.with_core(|core, pending| {
            core.flush_timer = None;
            core.try_flush(pending);
        });
    }
}

/// All mutable room state. Field access stays within `core::*` modules; the
/// host talks to [`Room`].
pub(crate) struct RoomCore {
    pub(crate) shared: Weak<RoomShared>,
    pub(crate) id_factory: IdFactory,
    pub(crate) connection: Connection,
    /// Set once the first channel opens; presence keyframes on later opens
    /// are reconnects.
    pub(crate) last_connection_id: Option<i32>,
    pub(crate) me: MyPresence,
    pub(crate) others: Others,
    pub(crate) pool: NodePool,
    pub(crate) root: Option<String>,
    pub(crate) storage_requested: bool,
    pub(crate) root_tx: watch::Sender<Option<String>>,
    pub(crate) ledger: UnackLedger,
    pub(crate) history: HistoryState,
    pub(crate) active_batch: Option<ActiveBatch>,
    pub(crate) batch_depth: usize,
    pub(crate) buffer: OutboundBuffer,
    pub(crate) throttle: Duration,
    pub(crate) last_flush: Option<tokio::time::Instant>,
    pub(crate) flush_timer: Option<tokio::task::JoinHandle<()>>,
    pub(crate) outbound: Option<mpsc::UnboundedSender<String>>,
    pub(crate) last_storage_status: StorageStatus,
    pub(crate) last_history_status: HistoryStatus,
    pub(crate) initial_storage: JsonObject,
}

impl RoomCore {
    pub(crate) fn new(
        shared: Weak<RoomShared>,
        config: &RoomConfig,
        root_tx: watch::Sender<Option<String>>,
    ) -> Self {
        let mut buffer = OutboundBuffer::default();
        // The very first flush after connecting carries the initial presence
        // as a full keyframe.
        buffer.queue_full_presence(config.initial_presence.clone());
        Self {
            shared,
            id_factory: IdFactory::new(0),
            connection: Connection::Closed,
            last_connection_id: None,
            me: MyPresence::new(config.initial_presence.clone()),
            others: Others::new(),
            pool: NodePool::new(),
            root: None,
            storage_requested: false,
            root_tx,
            ledger: UnackLedger::new(),
            history: HistoryState::new(),
            active_batch: None,
            batch_depth: 0,
            buffer,
            throttle: config.throttle,
            last_flush: None,
            flush_timer: None,
            outbound: None,
            last_storage_status: StorageStatus::NotLoaded,
            last_history_status: HistoryStatus::default(),
            initial_storage: config.initial_storage.clone(),
        }
    }

    // ---- Connection lifecycle (driven by the worker) ----

    pub(crate) fn set_connection_state(&mut self, next: Connection, pending: &mut PendingEvents) {
        let status = next.status();
        let changed = status != self.connection.status();
        self.connection = next;
        if changed {
            pending.connection = Some(status);
        }
    }

    /// Runs when the channel reaches open: adopt the session, queue the
    /// reconnect keyframe and storage resync, and flush.
    pub(crate) fn on_channel_open(
        &mut self,
        session: SessionInfo,
        outbound: mpsc::UnboundedSender<String>,
        pending: &mut PendingEvents,
    ) {
        self.outbound = Some(outbound);
        self.id_factory.rebase(session.actor);
        let reconnection = self.last_connection_id.is_some();
        self.last_connection_id = Some(session.actor);
        if reconnection {
            self.buffer.queue_full_presence(self.me.snapshot());
        }
        // Resync an existing root, or retry a fetch that never completed.
        if (self.root.is_some() || self.storage_requested)
            && !self
                .buffer
                .messages
                .iter()
                .any(|m| matches!(m, ClientMessage::FetchStorage))
        {
            self.buffer.messages.push(ClientMessage::FetchStorage);
        }
        self.set_connection_state(Connection::Open(session), pending);
        self.try_flush(pending);
    }

    /// Runs when the channel is torn down for any reason. The worker decides
    /// the next connection state; this only drops channel-scoped state.
    pub(crate) fn on_channel_closed(&mut self, pending: &mut PendingEvents) {
        self.outbound = None;
        self.others.clear();
        self.emit_others(OthersEventKind::Reset, pending);
    }

    // ---- Inbound dispatch ----

    /// Decodes one inbound frame and applies every message in order. A
    /// failing message never tears down the dispatcher.
    pub(crate) fn handle_frame(&mut self, text: &str, pending: &mut PendingEvents) {
        for message in parse_frame(text) {
            self.handle_message(message, pending);
        }
    }

    fn handle_message(&mut self, message: ServerMessage, pending: &mut PendingEvents) {
        match message {
            ServerMessage::UserJoined { actor, peer } => {
                self.others.set_connection(ConnectionMeta {
                    connection_id: actor,
                    user_id: peer.id,
                    user_info: peer.info,
                    is_read_only: scopes_imply_read_only(&peer.scopes),
                });
                // The joiner needs our full presence, sent directly to them.
                self.buffer.messages.push(ClientMessage::UpdatePresence {
                    data: self.me.snapshot(),
                    target_actor: Some(actor),
                });
                if let Some(user) = self.others.user(actor) {
                    self.emit_others(OthersEventKind::Enter { user }, pending);
                }
                self.try_flush(pending);
            }
            ServerMessage::UpdatePresence {
                actor,
                data,
                target_actor,
            } => {
                let had_connection = self.others.has_connection(actor);
                let was_visible = self.others.is_visible(actor);
                if target_actor.is_some() {
                    self.others.set_presence(actor, data.clone());
                } else {
                    self.others.patch_presence(actor, &data);
                }
                if !had_connection {
                    return;
                }
                let Some(user) = self.others.user(actor) else {
                    return;
                };
                if was_visible {
                    self.emit_others(OthersEventKind::Update { user, patch: data }, pending);
                } else if target_actor.is_some() {
                    self.emit_others(OthersEventKind::Enter { user }, pending);
                }
            }
            ServerMessage::BroadcastedEvent { actor, event } => {
                pending.custom.push(CustomEvent {
                    connection_id: actor,
                    event,
                });
            }
            ServerMessage::UserLeft { actor } => {
                let user = self.others.user(actor);
                self.others.remove(actor);
                if let Some(user) = user {
                    self.emit_others(OthersEventKind::Leave { user }, pending);
                }
            }
            ServerMessage::RoomState { users } => {
                let listed: Vec<i32> = users.iter().map(|(actor, _)| *actor).collect();
                self.others.retain_actors(&listed);
                for (actor, peer) in users {
                    self.others.set_connection(ConnectionMeta {
                        connection_id: actor,
                        user_id: peer.id,
                        user_info: peer.info,
                        is_read_only: scopes_imply_read_only(&peer.scopes),
                    });
                }
                self.emit_others(OthersEventKind::Reset, pending);
            }
            ServerMessage::InitialStorageState { items } => {
                self.handle_initial_storage(items, pending);
            }
            ServerMessage::UpdateStorage { ops } => {
                let applied =
                    self.apply_ops(ops.into_iter().map(HistoryOp::Op).collect(), false);
                self.record_storage_updates(applied.updates, pending);
                self.refresh_storage_status(pending);
            }
            ServerMessage::RejectStorageOp { op_ids, reason } => {
                let err = RoomError::StorageMutationRejected { op_ids, reason };
                error!("{err}; accepting divergence");
                pending.errors.push(err.clone());
                if cfg!(debug_assertions) {
                    panic!("{err}");
                }
            }
        }
    }

    // ---- Presence & broadcast ----

    pub(crate) fn update_presence(
        &mut self,
        patch: JsonObject,
        add_to_history: bool,
        pending: &mut PendingEvents,
    ) {
        let reverse = self.me.patch(&patch);
        if let Some(batch) = &mut self.active_batch {
            batch.reverse_ops.insert(0, HistoryOp::Presence { data: reverse });
            batch.presence = true;
            match &mut batch.presence_patch {
                Some(merged) => {
                    for (key, value) in patch {
                        merged.insert(key, value);
                    }
                }
                None => batch.presence_patch = Some(patch),
            }
        } else {
            if add_to_history {
                self.history
                    .push_undo(vec![HistoryOp::Presence { data: reverse }]);
                self.refresh_history_status(pending);
            }
            self.buffer.merge_presence_patch(&patch);
            pending.my_presence = Some(self.me.snapshot());
            self.try_flush(pending);
        }
    }

    pub(crate) fn broadcast_event(
        &mut self,
        event: Value,
        queue_if_not_ready: bool,
        pending: &mut PendingEvents,
    ) {
        if self.outbound.is_none() && !queue_if_not_ready {
            // Silent drop, matching the wire contract.
            return;
        }
        self.buffer.messages.push(ClientMessage::BroadcastEvent { event });
        self.try_flush(pending);
    }

    // ---- Local storage mutation ----

    pub(crate) fn assert_storage_writable(&self) -> Result<(), RoomError> {
        match self.connection.session() {
            Some(session) if session.is_read_only => Err(RoomError::WriteDenied),
            _ => Ok(()),
        }
    }

    /// Applies locally produced storage ops and routes their consequences:
    /// into the active batch if one is open, otherwise straight to history,
    /// buffer and observers.
    pub(crate) fn dispatch_local_ops(
        &mut self,
        ops: Vec<Op>,
        pending: &mut PendingEvents,
    ) -> Result<(), RoomError> {
        self.assert_storage_writable()?;
        let applied = self.apply_ops(ops.into_iter().map(HistoryOp::Op).collect(), true);
        if let Some(batch) = &mut self.active_batch {
            batch.ops.extend(applied.executed_ops);
            let mut reverse = applied.reverse;
            reverse.append(&mut batch.reverse_ops);
            batch.reverse_ops = reverse;
            batch.merge_storage_updates(applied.updates);
        } else {
            self.history.push_undo(applied.reverse);
            self.history.clear_redo();
            self.buffer.storage_ops.extend(applied.executed_ops);
            pending.merge_storage_updates(applied.updates);
            self.refresh_history_status(pending);
            self.try_flush(pending);
        }
        Ok(())
    }

    // ---- Batching ----

    pub(crate) fn begin_batch(&mut self) {
        self.batch_depth += 1;
        if self.active_batch.is_none() {
            self.active_batch = Some(ActiveBatch::default());
        }
    }

    pub(crate) fn commit_batch(&mut self, pending: &mut PendingEvents) {
        debug_assert!(self.batch_depth > 0);
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth > 0 {
            // Inner batches contribute to the outermost one.
            return;
        }
        let Some(batch) = self.active_batch.take() else {
            return;
        };
        self.history.push_undo(batch.reverse_ops);
        if !batch.ops.is_empty() {
            self.history.clear_redo();
            self.buffer.storage_ops.extend(batch.ops);
        }
        if let Some(patch) = batch.presence_patch {
            self.buffer.merge_presence_patch(&patch);
        }
        if batch.presence {
            pending.my_presence = Some(self.me.snapshot());
        }
        pending.others.extend(batch.others);
        pending.merge_storage_updates(batch.storage_updates.into_values());
        self.refresh_history_status(pending);
        self.try_flush(pending);
    }

    // ---- Undo / redo ----

    pub(crate) fn undo(&mut self, pending: &mut PendingEvents) -> Result<(), RoomError> {
        if self.active_batch.is_some() {
            return Err(RoomError::InvariantViolation(
                "undo is not allowed while a batch is in progress".into(),
            ));
        }
        let Some(batch) = self.history.pop_undo() else {
            return Ok(());
        };
        let applied = self.apply_ops(batch, true);
        self.history.push_redo(applied.reverse);
        self.finish_history_replay(applied.executed_ops, applied.updates, applied.presence_changed, pending);
        Ok(())
    }

    pub(crate) fn redo(&mut self, pending: &mut PendingEvents) -> Result<(), RoomError> {
        if self.active_batch.is_some() {
            return Err(RoomError::InvariantViolation(
                "redo is not allowed while a batch is in progress".into(),
            ));
        }
        let Some(batch) = self.history.pop_redo() else {
            return Ok(());
        };
        let applied = self.apply_ops(batch, true);
        self.history.push_undo(applied.reverse);
        self.finish_history_replay(applied.executed_ops, applied.updates, applied.presence_changed, pending);
        Ok(())
    }

    fn finish_history_replay(
        &mut self,
        executed_ops: Vec<Op>,
        updates: Vec<StorageUpdate>,
        presence_changed: bool,
        pending: &mut PendingEvents,
    ) {
        self.buffer.storage_ops.extend(executed_ops);
        if presence_changed {
            pending.my_presence = Some(self.me.snapshot());
        }
        pending.merge_storage_updates(updates);
        self.refresh_history_status(pending);
        self.try_flush(pending);
    }

    // ---- Status & event helpers ----

    pub(crate) fn compute_storage_status(&self) -> StorageStatus {
        match (&self.root, self.storage_requested) {
            (Some(_), _) if self.ledger.is_empty() => StorageStatus::Synchronized,
            (Some(_), _) => StorageStatus::Synchronizing,
            (None, true) => StorageStatus::Loading,
            (None, false) => StorageStatus::NotLoaded,
        }
    }

    /// Emits a storage-status event iff the derived status changed.
    pub(crate) fn refresh_storage_status(&mut self, pending: &mut PendingEvents) {
        let status = self.compute_storage_status();
        if status != self.last_storage_status {
            self.last_storage_status = status;
            pending.storage_status = Some(status);
        }
    }

    pub(crate) fn refresh_history_status(&mut self, pending: &mut PendingEvents) {
        let status = self.history.status();
        if status != self.last_history_status {
            self.last_history_status = status;
            pending.history = Some(status);
        }
    }

    /// Routes an others event to the active batch or straight to dispatch.
    pub(crate) fn emit_others(&mut self, kind: OthersEventKind, pending: &mut PendingEvents) {
        let event = OthersEvent {
            kind,
            others: self.others.visible_users(),
        };
        match &mut self.active_batch {
            Some(batch) => batch.others.push(event),
            None => pending.others.push(event),
        }
    }

    /// Routes storage updates to the active batch or to dispatch.
    pub(crate) fn record_storage_updates(
        &mut self,
        updates: Vec<StorageUpdate>,
        pending: &mut PendingEvents,
    ) {
        match &mut self.active_batch {
            Some(batch) => batch.merge_storage_updates(updates),
            None => pending.merge_storage_updates(updates),
        }
    }

    /// Marks storage as wanted, queueing a fetch on first call.
    pub(crate) fn request_storage(&mut self, pending: &mut PendingEvents) {
        if self.root.is_none() && !self.storage_requested {
            self.storage_requested = true;
            self.buffer.messages.push(ClientMessage::FetchStorage);
            self.refresh_storage_status(pending);
            self.try_flush(pending);
        }
    }
}

/// A handle to one collaborative room: the stable surface consumed by host
/// applications.
///
/// Constructing a room spawns its connection worker, so `enter` must be
/// called within a tokio runtime.
pub struct Room {
    shared: Arc<RoomShared>,
    worker: tokio::task::JoinHandle<()>,
}

impl Room {
    /// Connects to the configured room and returns its handle.
    pub fn enter(config: RoomConfig) -> Result<Self, RoomError> {
        config.validate()?;
        let batch_updates = config.hooks.batch_updates();
        let (root_tx, _) = watch::channel(None);
        let (shutdown_tx, _) = broadcast::channel(4);
        let (reconnect_tx, _) = broadcast::channel(4);
        let shared = Arc::new_cyclic(|weak: &Weak<RoomShared>| RoomShared {
            core: Mutex::new(RoomCore::new(weak.clone(), &config, root_tx)),
            events: RwLock::new(RoomEvents::new(batch_updates.clone())),
            batch_updates,
            shutdown_tx,
            reconnect_tx,
            runtime: tokio::runtime::Handle::current(),
            config,
        });
        let worker = ConnectionWorker::new(shared.clone());
        let handle = tokio::spawn(worker.run());
        info!("Entered room '{}'", shared.config.room_id);
        Ok(Self {
            shared,
            worker: handle,
        })
    }

    // ---- Presence ----

    /// Merges `patch` into the local presence and queues it for the peers.
    /// `null` values remove keys. With `add_to_history`, the change becomes
    /// undoable.
    pub fn update_presence(&self, patch: JsonObject, add_to_history: bool) {
        self.shared
            .with_core(|core, pending| core.update_presence(patch, add_to_history, pending));
    }

    pub fn my_presence(&self) -> JsonObject {
        self.shared.with_core(|core, _| core.me.snapshot())
    }

    /// Snapshot of every visible peer.
    pub fn others(&self) -> Vec<User> {
        self.shared.with_core(|core, _| core.others.visible_users())
    }

    /// Broadcasts an application event to every peer. When the channel is
    /// not open the event is dropped unless `queue_if_not_ready` is set.
    pub fn broadcast_event(&self, event: Value, queue_if_not_ready: bool) {
        self.shared
            .with_core(|core, pending| core.broadcast_event(event, queue_if_not_ready, pending));
    }

    // ---- Storage mutation ----

    /// Creates an object node under `parent_id` at `key` and returns its id.
    pub fn create_object(
        &self,
        parent_id: &str,
        key: &str,
        data: JsonObject,
    ) -> Result<String, RoomError> {
        self.create_node(|id| Op::CreateObject {
            op_id: None,
            id,
            parent_id: Some(parent_id.to_string()),
            parent_key: Some(key.to_string()),
            data,
        })
    }

    pub fn create_list(&self, parent_id: &str, key: &str) -> Result<String, RoomError> {
        self.create_node(|id| Op::CreateList {
            op_id: None,
            id,
            parent_id: parent_id.to_string(),
            parent_key: key.to_string(),
        })
    }

    pub fn create_map(&self, parent_id: &str, key: &str) -> Result<String, RoomError> {
        self.create_node(|id| Op::CreateMap {
            op_id: None,
            id,
            parent_id: parent_id.to_string(),
            parent_key: key.to_string(),
        })
    }

    /// Creates a register holding `value` under `parent_id` at `key` (for
    /// lists, `key` is a fractional position).
    pub fn create_register(
        &self,
        parent_id: &str,
        key: &str,
        value: Value,
    ) -> Result<String, RoomError> {
        self.create_node(|id| Op::CreateRegister {
            op_id: None,
            id,
            parent_id: parent_id.to_string(),
            parent_key: key.to_string(),
            data: value,
        })
    }

    fn create_node(&self, build: impl FnOnce(String) -> Op) -> Result<String, RoomError> {
        self.shared.with_core(|core, pending| {
            core.assert_storage_writable()?;
            let id = core.id_factory.generate_node_id();
            core.dispatch_local_ops(vec![build(id.clone())], pending)?;
            Ok(id)
        })
    }

    /// Appends `value` to the list `list_id` and returns the new item's id.
    pub fn push_list_item(&self, list_id: &str, value: Value) -> Result<String, RoomError> {
        self.shared.with_core(|core, pending| {
            core.assert_storage_writable()?;
            let position = core.list_position(list_id, usize::MAX)?;
            let id = core.id_factory.generate_node_id();
            core.dispatch_local_ops(
                vec![Op::CreateRegister {
                    op_id: None,
                    id: id.clone(),
                    parent_id: list_id.to_string(),
                    parent_key: position,
                    data: value,
                }],
                pending,
            )?;
            Ok(id)
        })
    }

    /// Inserts `value` into the list `list_id` at `index`.
    pub fn insert_list_item(
        &self,
        list_id: &str,
        index: usize,
        value: Value,
    ) -> Result<String, RoomError> {
        self.shared.with_core(|core, pending| {
            core.assert_storage_writable()?;
            let position = core.list_position(list_id, index)?;
            let id = core.id_factory.generate_node_id();
            core.dispatch_local_ops(
                vec![Op::CreateRegister {
                    op_id: None,
                    id: id.clone(),
                    parent_id: list_id.to_string(),
                    parent_key: position,
                    data: value,
                }],
                pending,
            )?;
            Ok(id)
        })
    }

    /// Shallow-merges `data` into the object node `id`.
    pub fn update_object(&self, id: &str, data: JsonObject) -> Result<(), RoomError> {
        self.shared.with_core(|core, pending| {
            core.dispatch_local_ops(
                vec![Op::UpdateObject {
                    op_id: None,
                    id: id.to_string(),
                    data,
                }],
                pending,
            )
        })
    }

    pub fn delete_object_key(&self, id: &str, key: &str) -> Result<(), RoomError> {
        self.shared.with_core(|core, pending| {
            core.dispatch_local_ops(
                vec![Op::DeleteObjectKey {
                    op_id: None,
                    id: id.to_string(),
                    key: key.to_string(),
                }],
                pending,
            )
        })
    }

    /// Moves a list child to a new fractional position.
    pub fn set_parent_key(&self, id: &str, position: &str) -> Result<(), RoomError> {
        self.shared.with_core(|core, pending| {
            core.dispatch_local_ops(
                vec![Op::SetParentKey {
                    op_id: None,
                    id: id.to_string(),
                    parent_key: position.to_string(),
                }],
                pending,
            )
        })
    }

    /// Deletes a node and its whole subtree.
    pub fn delete_node(&self, id: &str) -> Result<(), RoomError> {
        self.shared.with_core(|core, pending| {
            core.dispatch_local_ops(
                vec![Op::DeleteCrdt {
                    op_id: None,
                    id: id.to_string(),
                }],
                pending,
            )
        })
    }

    // ---- Batching & history ----

    /// Runs `f` with an active batch: mutations inside apply to the replica
    /// immediately but commit to observers, history and the wire as one
    /// unit. Nested calls contribute to the outermost batch.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.with_core(|core, _| core.begin_batch());
        let guard = BatchGuard { shared: &self.shared };
        let result = f();
        drop(guard);
        result
    }

    /// Undoes the most recent history batch. Fails while a batch is open.
    pub fn undo(&self) -> Result<(), RoomError> {
        self.shared.with_core(|core, pending| core.undo(pending))
    }

    /// Reapplies the most recently undone batch. Fails while a batch is open.
    pub fn redo(&self) -> Result<(), RoomError> {
        self.shared.with_core(|core, pending| core.redo(pending))
    }

    pub fn can_undo(&self) -> bool {
        self.shared.with_core(|core, _| core.history.can_undo())
    }

    pub fn can_redo(&self) -> bool {
        self.shared.with_core(|core, _| core.history.can_redo())
    }

    /// Pauses history: subsequent reverse ops accumulate into one unit.
    pub fn pause_history(&self) {
        self.shared.with_core(|core, _| core.history.pause());
    }

    /// Resumes history, committing the paused unit onto the undo stack.
    pub fn resume_history(&self) {
        self.shared.with_core(|core, pending| {
            core.history.resume();
            core.refresh_history_status(pending);
        });
    }

    // ---- Storage access ----

    /// Waits until the storage root is loaded and returns its node id. Kicks
    /// off loading if nobody asked yet.
    pub async fn storage(&self) -> Result<String, RoomError> {
        let mut rx = self.shared.with_core(|core, pending| {
            core.request_storage(pending);
            core.root_tx.subscribe()
        });
        loop {
            if let Some(root) = rx.borrow_and_update().clone() {
                return Ok(root);
            }
            rx.changed().await.map_err(|_| RoomError::Closed)?;
        }
    }

    /// The root node id if storage is loaded; kicks off loading otherwise.
    pub fn storage_snapshot(&self) -> Option<String> {
        self.shared.with_core(|core, pending| {
            core.request_storage(pending);
            core.root.clone()
        })
    }

    pub fn storage_status(&self) -> StorageStatus {
        self.shared.with_core(|core, _| core.compute_storage_status())
    }

    /// Renders the whole storage tree as plain JSON, if loaded.
    pub fn render_storage(&self) -> Option<Value> {
        self.shared.with_core(|core, _| {
            let root = core.root.clone()?;
            core.pool.render_json(&root)
        })
    }

    /// Renders one node's subtree as plain JSON.
    pub fn render_node(&self, id: &str) -> Option<Value> {
        self.shared.with_core(|core, _| core.pool.render_json(id))
    }

    /// The wire form of one node, if present.
    pub fn serialize_node(&self, id: &str) -> Option<SerializedCrdt> {
        self.shared.with_core(|core, _| core.pool.serialize_node(id))
    }

    // ---- Connection ----

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.with_core(|core, _| core.connection.status())
    }

    /// Who the current session is, if the connection is self-aware.
    pub fn self_session(&self) -> Option<SessionInfo> {
        self.shared
            .with_core(|core, _| core.connection.session().cloned())
    }

    /// Tears down the current channel and re-enters the connection cycle.
    /// Idempotent; a no-op after `disconnect`.
    pub fn reconnect(&self) {
        let _ = self.shared.reconnect_tx.send(());
    }

    /// Hard stop: closes the channel, clears timers and others, and closes
    /// every event subscription.
    pub fn disconnect(&self) {
        let _ = self.shared.shutdown_tx.send(());
        self.shared.with_core(|core, pending| {
            core.abort_flush_timer();
            core.outbound = None;
            core.others.clear();
            core.emit_others(OthersEventKind::Reset, pending);
            core.set_connection_state(Connection::Closed, pending);
        });
        let mut events = self.shared.events.write();
        *events = RoomEvents::closed(self.shared.batch_updates.clone());
        self.worker.abort();
    }

    // ---- Subscriptions ----

    pub fn subscribe_error(&self) -> broadcast::Receiver<RoomError> {
        self.shared.events.read().subscribe_error()
    }

    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.shared.events.read().subscribe_connection()
    }

    pub fn subscribe_storage_status(&self) -> broadcast::Receiver<StorageStatus> {
        self.shared.events.read().subscribe_storage_status()
    }

    pub fn subscribe_my_presence(&self) -> broadcast::Receiver<JsonObject> {
        self.shared.events.read().subscribe_my_presence()
    }

    pub fn subscribe_others(&self) -> broadcast::Receiver<OthersEvent> {
        self.shared.events.read().subscribe_others()
    }

    pub fn subscribe_custom(&self) -> broadcast::Receiver<CustomEvent> {
        self.shared.events.read().subscribe_custom()
    }

    pub fn subscribe_storage(&self) -> broadcast::Receiver<Arc<Vec<StorageUpdate>>> {
        self.shared.events.read().subscribe_storage()
    }

    pub fn subscribe_history(&self) -> broadcast::Receiver<HistoryStatus> {
        self.shared.events.read().subscribe_history()
    }

    /// Subscribes to updates on one node: its own updates (`Shallow`) or its
    /// whole subtree (`Deep`).
    pub fn subscribe_node(&self, node_id: &str, depth: SubscriptionDepth) -> NodeSubscription {
        self.shared.events.read().subscribe_node(node_id, depth)
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        let _ = self.shared.shutdown_tx.send(());
        self.worker.abort();
    }
}

/// Commits the batch even if the host closure panics.
struct BatchGuard<'a> {
    shared: &'a Arc<RoomShared>,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.shared
            .with_core(|core, pending| core.commit_batch(pending));
    }
}
