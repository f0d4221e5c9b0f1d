// src/core/protocol/mod.rs

//! Wire-level message and op definitions for the room protocol.
//!
//! Frames are JSON text. Every message carries a small integer opcode in its
//! `type` field; a single frame may hold one message object or an array of
//! them. The server additionally sends the literal (non-JSON) string `"pong"`
//! in response to `"ping"`, which is handled at the channel layer before
//! decoding.

pub mod decode;

use serde_json::{Value, json};

pub use decode::parse_frame;

/// A plain JSON object, used for presence records and object/map payloads.
pub type JsonObject = serde_json::Map<String, Value>;

/// Opcodes for client → server messages.
pub mod client_msg_code {
    pub const UPDATE_PRESENCE: u64 = 100;
    pub const BROADCAST_EVENT: u64 = 103;
    pub const FETCH_STORAGE: u64 = 200;
    pub const UPDATE_STORAGE: u64 = 201;
}

/// Opcodes for server → client messages.
pub mod server_msg_code {
    pub const UPDATE_PRESENCE: u64 = 100;
    pub const USER_JOINED: u64 = 101;
    pub const USER_LEFT: u64 = 102;
    pub const BROADCASTED_EVENT: u64 = 103;
    pub const ROOM_STATE: u64 = 104;
    pub const INITIAL_STORAGE_STATE: u64 = 200;
    pub const UPDATE_STORAGE: u64 = 201;
    pub const REJECT_STORAGE_OP: u64 = 299;
}

/// Opcodes for storage ops.
pub mod op_code {
    pub const SET_PARENT_KEY: u64 = 1;
    pub const CREATE_LIST: u64 = 2;
    pub const UPDATE_OBJECT: u64 = 3;
    pub const CREATE_OBJECT: u64 = 4;
    pub const DELETE_CRDT: u64 = 5;
    pub const DELETE_OBJECT_KEY: u64 = 6;
    pub const CREATE_MAP: u64 = 7;
    pub const CREATE_REGISTER: u64 = 8;
    pub const ACK: u64 = 9;
}

/// Type tags for serialized CRDT nodes in `INITIAL_STORAGE_STATE` items.
pub mod crdt_type {
    pub const OBJECT: u64 = 0;
    pub const LIST: u64 = 1;
    pub const MAP: u64 = 2;
    pub const REGISTER: u64 = 3;
}

/// The broadcast sentinel for a full presence keyframe.
pub const BROADCAST_ALL: i32 = -1;

/// Parent link of a non-root node: the parent's node id plus the key (or list
/// position) under which the child hangs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub id: String,
    pub key: String,
}

/// A single mutation descriptor on the CRDT tree, or an `Ack` echo.
///
/// Every non-`Ack` op carries an `op_id` once it has been dispatched; ops
/// replayed from history are stored without one and get a fresh id on
/// re-dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    CreateObject {
        op_id: Option<String>,
        id: String,
        parent_id: Option<String>,
        parent_key: Option<String>,
        data: JsonObject,
    },
    CreateList {
        op_id: Option<String>,
        id: String,
        parent_id: String,
        parent_key: String,
    },
    CreateMap {
        op_id: Option<String>,
        id: String,
        parent_id: String,
        parent_key: String,
    },
    CreateRegister {
        op_id: Option<String>,
        id: String,
        parent_id: String,
        parent_key: String,
        data: Value,
    },
    UpdateObject {
        op_id: Option<String>,
        id: String,
        data: JsonObject,
    },
    DeleteObjectKey {
        op_id: Option<String>,
        id: String,
        key: String,
    },
    SetParentKey {
        op_id: Option<String>,
        id: String,
        parent_key: String,
    },
    DeleteCrdt {
        op_id: Option<String>,
        id: String,
    },
    /// A server echo confirming one of our ops. No state effect.
    Ack { op_id: String },
}

impl Op {
    pub fn op_id(&self) -> Option<&str> {
        match self {
            Op::CreateObject { op_id, .. }
            | Op::CreateList { op_id, .. }
            | Op::CreateMap { op_id, .. }
            | Op::CreateRegister { op_id, .. }
            | Op::UpdateObject { op_id, .. }
            | Op::DeleteObjectKey { op_id, .. }
            | Op::SetParentKey { op_id, .. }
            | Op::DeleteCrdt { op_id, .. } => op_id.as_deref(),
            Op::Ack { op_id } => Some(op_id),
        }
    }

    pub fn set_op_id(&mut self, new_id: String) {
        match self {
            Op::CreateObject { op_id, .. }
            | Op::CreateList { op_id, .. }
            | Op::CreateMap { op_id, .. }
            | Op::CreateRegister { op_id, .. }
            | Op::UpdateObject { op_id, .. }
            | Op::DeleteObjectKey { op_id, .. }
            | Op::SetParentKey { op_id, .. }
            | Op::DeleteCrdt { op_id, .. } => *op_id = Some(new_id),
            Op::Ack { op_id } => *op_id = new_id,
        }
    }

    /// The node this op targets (for creates, the node being created).
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Op::CreateObject { id, .. }
            | Op::CreateList { id, .. }
            | Op::CreateMap { id, .. }
            | Op::CreateRegister { id, .. }
            | Op::UpdateObject { id, .. }
            | Op::DeleteObjectKey { id, .. }
            | Op::SetParentKey { id, .. }
            | Op::DeleteCrdt { id, .. } => Some(id),
            Op::Ack { .. } => None,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(
            self,
            Op::CreateObject { .. }
                | Op::CreateList { .. }
                | Op::CreateMap { .. }
                | Op::CreateRegister { .. }
        )
    }

    pub fn to_json(&self) -> Value {
        fn put_op_id(obj: &mut JsonObject, op_id: &Option<String>) {
            if let Some(op_id) = op_id {
                obj.insert("opId".into(), json!(op_id));
            }
        }
        match self {
            Op::CreateObject {
                op_id,
                id,
                parent_id,
                parent_key,
                data,
            } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(op_code::CREATE_OBJECT));
                put_op_id(&mut obj, op_id);
                obj.insert("id".into(), json!(id));
                if let Some(parent_id) = parent_id {
                    obj.insert("parentId".into(), json!(parent_id));
                }
                if let Some(parent_key) = parent_key {
                    obj.insert("parentKey".into(), json!(parent_key));
                }
                obj.insert("data".into(), Value::Object(data.clone()));
                Value::Object(obj)
            }
            Op::CreateList {
                op_id,
                id,
                parent_id,
                parent_key,
            } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(op_code::CREATE_LIST));
                put_op_id(&mut obj, op_id);
                obj.insert("id".into(), json!(id));
                obj.insert("parentId".into(), json!(parent_id));
                obj.insert("parentKey".into(), json!(parent_key));
                Value::Object(obj)
            }
            Op::CreateMap {
                op_id,
                id,
                parent_id,
                parent_key,
            } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(op_code::CREATE_MAP));
                put_op_id(&mut obj, op_id);
                obj.insert("id".into(), json!(id));
                obj.insert("parentId".into(), json!(parent_id));
                obj.insert("parentKey".into(), json!(parent_key));
                Value::Object(obj)
            }
            Op::CreateRegister {
                op_id,
                id,
                parent_id,
                parent_key,
                data,
            } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(op_code::CREATE_REGISTER));
                put_op_id(&mut obj, op_id);
                obj.insert("id".into(), json!(id));
                obj.insert("parentId".into(), json!(parent_id));
                obj.insert("parentKey".into(), json!(parent_key));
                obj.insert("data".into(), data.clone());
                Value::Object(obj)
            }
            Op::UpdateObject { op_id, id, data } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(op_code::UPDATE_OBJECT));
                put_op_id(&mut obj, op_id);
                obj.insert("id".into(), json!(id));
                obj.insert("data".into(), Value::Object(data.clone()));
                Value::Object(obj)
            }
            Op::DeleteObjectKey { op_id, id, key } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(op_code::DELETE_OBJECT_KEY));
                put_op_id(&mut obj, op_id);
                obj.insert("id".into(), json!(id));
                obj.insert("key".into(), json!(key));
                Value::Object(obj)
            }
            Op::SetParentKey {
                op_id,
                id,
                parent_key,
            } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(op_code::SET_PARENT_KEY));
                put_op_id(&mut obj, op_id);
                obj.insert("id".into(), json!(id));
                obj.insert("parentKey".into(), json!(parent_key));
                Value::Object(obj)
            }
            Op::DeleteCrdt { op_id, id } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(op_code::DELETE_CRDT));
                put_op_id(&mut obj, op_id);
                obj.insert("id".into(), json!(id));
                Value::Object(obj)
            }
            Op::Ack { op_id } => json!({ "type": op_code::ACK, "opId": op_id }),
        }
    }
}

/// The wire form of one CRDT node, as found in `INITIAL_STORAGE_STATE` items.
#[derive(Debug, Clone, PartialEq)]
pub enum SerializedCrdt {
    Object {
        parent: Option<ParentRef>,
        data: JsonObject,
    },
    List { parent: ParentRef },
    Map { parent: ParentRef },
    Register { parent: ParentRef, data: Value },
}

impl SerializedCrdt {
    pub fn parent(&self) -> Option<&ParentRef> {
        match self {
            SerializedCrdt::Object { parent, .. } => parent.as_ref(),
            SerializedCrdt::List { parent }
            | SerializedCrdt::Map { parent }
            | SerializedCrdt::Register { parent, .. } => Some(parent),
        }
    }

    pub fn to_json(&self) -> Value {
        fn put_parent(obj: &mut JsonObject, parent: &ParentRef) {
            obj.insert("parentId".into(), json!(parent.id));
            obj.insert("parentKey".into(), json!(parent.key));
        }
        match self {
            SerializedCrdt::Object { parent, data } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(crdt_type::OBJECT));
                if let Some(parent) = parent {
                    put_parent(&mut obj, parent);
                }
                obj.insert("data".into(), Value::Object(data.clone()));
                Value::Object(obj)
            }
            SerializedCrdt::List { parent } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(crdt_type::LIST));
                put_parent(&mut obj, parent);
                Value::Object(obj)
            }
            SerializedCrdt::Map { parent } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(crdt_type::MAP));
                put_parent(&mut obj, parent);
                Value::Object(obj)
            }
            SerializedCrdt::Register { parent, data } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(crdt_type::REGISTER));
                put_parent(&mut obj, parent);
                obj.insert("data".into(), data.clone());
                Value::Object(obj)
            }
        }
    }
}

/// A client → server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    UpdatePresence {
        data: JsonObject,
        /// `None` is a patch; `Some(-1)` is a broadcast keyframe; any other
        /// value is a full snapshot sent directly to that actor.
        target_actor: Option<i32>,
    },
    BroadcastEvent { event: Value },
    FetchStorage,
    UpdateStorage { ops: Vec<Op> },
}

impl ClientMessage {
    pub fn to_json(&self) -> Value {
        match self {
            ClientMessage::UpdatePresence { data, target_actor } => {
                let mut obj = JsonObject::new();
                obj.insert("type".into(), json!(client_msg_code::UPDATE_PRESENCE));
                if let Some(target) = target_actor {
                    obj.insert("targetActor".into(), json!(target));
                }
                obj.insert("data".into(), Value::Object(data.clone()));
                Value::Object(obj)
            }
            ClientMessage::BroadcastEvent { event } => {
                json!({ "type": client_msg_code::BROADCAST_EVENT, "event": event })
            }
            ClientMessage::FetchStorage => json!({ "type": client_msg_code::FETCH_STORAGE }),
            ClientMessage::UpdateStorage { ops } => {
                let ops: Vec<Value> = ops.iter().map(Op::to_json).collect();
                json!({ "type": client_msg_code::UPDATE_STORAGE, "ops": ops })
            }
        }
    }
}

/// Encodes a group of outbound messages into one text frame. A single message
/// is sent as a bare object, several as a JSON array.
pub fn encode_frame(messages: &[ClientMessage]) -> String {
    match messages {
        [single] => single.to_json().to_string(),
        many => Value::Array(many.iter().map(ClientMessage::to_json).collect()).to_string(),
    }
}

/// Connection metadata for a peer, as carried by `USER_JOINED` and `ROOM_STATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: Option<String>,
    pub info: Option<Value>,
    pub scopes: Vec<String>,
}

/// A server → client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    UpdatePresence {
        actor: i32,
        data: JsonObject,
        /// Present iff the message is a full snapshot rather than a patch.
        target_actor: Option<i32>,
    },
    UserJoined { actor: i32, peer: PeerInfo },
    UserLeft { actor: i32 },
    BroadcastedEvent { actor: i32, event: Value },
    RoomState { users: Vec<(i32, PeerInfo)> },
    InitialStorageState { items: Vec<(String, SerializedCrdt)> },
    UpdateStorage { ops: Vec<Op> },
    RejectStorageOp { op_ids: Vec<String>, reason: String },
}
