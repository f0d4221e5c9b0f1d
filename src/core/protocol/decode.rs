// src/core/protocol/decode.rs

//! Tagged-variant decoder for inbound frames.
//!
//! Inbound frames are decoded structurally, field by field, rather than
//! through derived deserializers: the `type` discriminant is a small integer
//! and unknown message types must be skippable without failing the whole
//! frame.

use super::{
    JsonObject, Op, ParentRef, PeerInfo, SerializedCrdt, ServerMessage, crdt_type, op_code,
    server_msg_code,
};
use crate::core::errors::RoomError;
use serde_json::Value;
use tracing::warn;

/// Parses one text frame into its messages.
///
/// A frame is either a single JSON object or a JSON array of objects. Parse
/// failures and empty arrays yield an empty message list; individual messages
/// with an unknown `type` are skipped with a warning.
pub fn parse_frame(text: &str) -> Vec<ServerMessage> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!("Ignoring unparseable inbound frame: {err}");
            return Vec::new();
        }
    };

    let raw_messages = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        other => {
            warn!("Ignoring inbound frame of unexpected shape: {other}");
            return Vec::new();
        }
    };

    let mut messages = Vec::with_capacity(raw_messages.len());
    for raw in &raw_messages {
        match server_message_from_json(raw) {
            Ok(msg) => messages.push(msg),
            Err(err) => warn!("Skipping undecodable inbound message: {err}"),
        }
    }
    messages
}

pub fn server_message_from_json(value: &Value) -> Result<ServerMessage, RoomError> {
    let obj = as_object(value)?;
    let msg_type = get_u64(obj, "type")?;
    match msg_type {
        server_msg_code::UPDATE_PRESENCE => Ok(ServerMessage::UpdatePresence {
            actor: get_i32(obj, "actor")?,
            data: get_object(obj, "data")?,
            target_actor: opt_i32(obj, "targetActor")?,
        }),
        server_msg_code::USER_JOINED => Ok(ServerMessage::UserJoined {
            actor: get_i32(obj, "actor")?,
            peer: peer_info_from(obj)?,
        }),
        server_msg_code::USER_LEFT => Ok(ServerMessage::UserLeft {
            actor: get_i32(obj, "actor")?,
        }),
        server_msg_code::BROADCASTED_EVENT => Ok(ServerMessage::BroadcastedEvent {
            actor: get_i32(obj, "actor")?,
            event: obj
                .get("event")
                .cloned()
                .ok_or_else(|| missing("event"))?,
        }),
        server_msg_code::ROOM_STATE => {
            let users_obj = get_object(obj, "users")?;
            let mut users = Vec::with_capacity(users_obj.len());
            for (actor_key, meta) in &users_obj {
                let actor: i32 = actor_key.parse().map_err(|_| {
                    RoomError::Protocol(format!("ROOM_STATE actor key '{actor_key}' is not an integer"))
                })?;
                users.push((actor, peer_info_from(as_object(meta)?)?));
            }
            Ok(ServerMessage::RoomState { users })
        }
        server_msg_code::INITIAL_STORAGE_STATE => {
            let raw_items = get_array(obj, "items")?;
            let mut items = Vec::with_capacity(raw_items.len());
            for raw in raw_items {
                let pair = raw.as_array().filter(|pair| pair.len() == 2).ok_or_else(|| {
                    RoomError::Protocol("storage item is not an [id, crdt] pair".into())
                })?;
                let id = pair[0]
                    .as_str()
                    .ok_or_else(|| RoomError::Protocol("storage item id is not a string".into()))?;
                items.push((id.to_string(), serialized_crdt_from_json(&pair[1])?));
            }
            Ok(ServerMessage::InitialStorageState { items })
        }
        server_msg_code::UPDATE_STORAGE => {
            let raw_ops = get_array(obj, "ops")?;
            let mut ops = Vec::with_capacity(raw_ops.len());
            for raw in raw_ops {
                ops.push(op_from_json(raw)?);
            }
            Ok(ServerMessage::UpdateStorage { ops })
        }
        server_msg_code::REJECT_STORAGE_OP => {
            let op_ids = get_array(obj, "opIds")?
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            Ok(ServerMessage::RejectStorageOp {
                op_ids,
                reason: get_string(obj, "reason")?,
            })
        }
        other => Err(RoomError::Protocol(format!(
            "Unknown server message type {other}"
        ))),
    }
}

pub fn op_from_json(value: &Value) -> Result<Op, RoomError> {
    let obj = as_object(value)?;
    let op_type = get_u64(obj, "type")?;
    let op_id = opt_string(obj, "opId");
    match op_type {
        op_code::CREATE_OBJECT => Ok(Op::CreateObject {
            op_id,
            id: get_string(obj, "id")?,
            parent_id: opt_string(obj, "parentId"),
            parent_key: opt_string(obj, "parentKey"),
            data: get_object(obj, "data")?,
        }),
        op_code::CREATE_LIST => Ok(Op::CreateList {
            op_id,
            id: get_string(obj, "id")?,
            parent_id: get_string(obj, "parentId")?,
            parent_key: get_string(obj, "parentKey")?,
        }),
        op_code::CREATE_MAP => Ok(Op::CreateMap {
            op_id,
            id: get_string(obj, "id")?,
            parent_id: get_string(obj, "parentId")?,
            parent_key: get_string(obj, "parentKey")?,
        }),
        op_code::CREATE_REGISTER => Ok(Op::CreateRegister {
            op_id,
            id: get_string(obj, "id")?,
            parent_id: get_string(obj, "parentId")?,
            parent_key: get_string(obj, "parentKey")?,
            data: obj.get("data").cloned().ok_or_else(|| missing("data"))?,
        }),
        op_code::UPDATE_OBJECT => Ok(Op::UpdateObject {
            op_id,
            id: get_string(obj, "id")?,
            data: get_object(obj, "data")?,
        }),
        op_code::DELETE_OBJECT_KEY => Ok(Op::DeleteObjectKey {
            op_id,
            id: get_string(obj, "id")?,
            key: get_string(obj, "key")?,
        }),
        op_code::SET_PARENT_KEY => Ok(Op::SetParentKey {
            op_id,
            id: get_string(obj, "id")?,
            parent_key: get_string(obj, "parentKey")?,
        }),
        op_code::DELETE_CRDT => Ok(Op::DeleteCrdt {
            op_id,
            id: get_string(obj, "id")?,
        }),
        op_code::ACK => Ok(Op::Ack {
            op_id: get_string(obj, "opId")?,
        }),
        other => Err(RoomError::Protocol(format!("Unknown op type {other}"))),
    }
}

pub fn serialized_crdt_from_json(value: &Value) -> Result<SerializedCrdt, RoomError> {
    let obj = as_object(value)?;
    let tag = get_u64(obj, "type")?;
    match tag {
        crdt_type::OBJECT => Ok(SerializedCrdt::Object {
            parent: opt_parent(obj)?,
            data: get_object(obj, "data")?,
        }),
        crdt_type::LIST => Ok(SerializedCrdt::List {
            parent: required_parent(obj)?,
        }),
        crdt_type::MAP => Ok(SerializedCrdt::Map {
            parent: required_parent(obj)?,
        }),
        crdt_type::REGISTER => Ok(SerializedCrdt::Register {
            parent: required_parent(obj)?,
            data: obj.get("data").cloned().ok_or_else(|| missing("data"))?,
        }),
        other => Err(RoomError::Protocol(format!("Unknown crdt type {other}"))),
    }
}

fn opt_parent(obj: &JsonObject) -> Result<Option<ParentRef>, RoomError> {
    match (opt_string(obj, "parentId"), opt_string(obj, "parentKey")) {
        (Some(id), Some(key)) => Ok(Some(ParentRef { id, key })),
        (None, None) => Ok(None),
        _ => Err(RoomError::Protocol(
            "parentId and parentKey must be present together".into(),
        )),
    }
}

fn required_parent(obj: &JsonObject) -> Result<ParentRef, RoomError> {
    opt_parent(obj)?.ok_or_else(|| missing("parentId"))
}

fn peer_info_from(obj: &JsonObject) -> Result<PeerInfo, RoomError> {
    let scopes = match obj.get("scopes") {
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    Ok(PeerInfo {
        id: opt_string(obj, "id"),
        info: obj.get("info").filter(|v| !v.is_null()).cloned(),
        scopes,
    })
}

fn missing(field: &str) -> RoomError {
    RoomError::Protocol(format!("Missing required field '{field}'"))
}

fn as_object(value: &Value) -> Result<&JsonObject, RoomError> {
    value
        .as_object()
        .ok_or_else(|| RoomError::Protocol("Expected a JSON object".into()))
}

fn get_u64(obj: &JsonObject, field: &str) -> Result<u64, RoomError> {
    obj.get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| missing(field))
}

fn get_i32(obj: &JsonObject, field: &str) -> Result<i32, RoomError> {
    obj.get(field)
        .and_then(Value::as_i64)
        .map(|n| n as i32)
        .ok_or_else(|| missing(field))
}

fn opt_i32(obj: &JsonObject, field: &str) -> Result<Option<i32>, RoomError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(|n| Some(n as i32))
            .ok_or_else(|| RoomError::Protocol(format!("Field '{field}' is not an integer"))),
    }
}

fn get_string(obj: &JsonObject, field: &str) -> Result<String, RoomError> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(field))
}

fn opt_string(obj: &JsonObject, field: &str) -> Option<String> {
    obj.get(field).and_then(Value::as_str).map(str::to_string)
}

fn get_object(obj: &JsonObject, field: &str) -> Result<JsonObject, RoomError> {
    obj.get(field)
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| missing(field))
}

fn get_array<'a>(obj: &'a JsonObject, field: &str) -> Result<&'a Vec<Value>, RoomError> {
    obj.get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| missing(field))
}
