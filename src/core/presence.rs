// src/core/presence.rs

//! Presence state: the local user's record ("me") and the per-actor view of
//! every peer ("others").

use crate::core::protocol::JsonObject;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// The local user's presence record.
///
/// A patch is a shallow merge; a `null` value removes the key. `patch`
/// returns the reverse delta (the prior value of every affected key, `null`
/// for keys that were absent), which is what the history engine stores.
#[derive(Debug, Default)]
pub struct MyPresence {
    data: JsonObject,
}

impl MyPresence {
    pub fn new(initial: JsonObject) -> Self {
        Self { data: initial }
    }

    pub fn snapshot(&self) -> JsonObject {
        self.data.clone()
    }

    pub fn patch(&mut self, delta: &JsonObject) -> JsonObject {
        let mut reverse = JsonObject::new();
        for (key, value) in delta {
            let old = if value.is_null() {
                self.data.shift_remove(key)
            } else {
                self.data.insert(key.clone(), value.clone())
            };
            reverse.insert(key.clone(), old.unwrap_or(Value::Null));
        }
        reverse
    }
}

/// Connection metadata for one peer, learned from `USER_JOINED`/`ROOM_STATE`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionMeta {
    pub connection_id: i32,
    pub user_id: Option<String>,
    pub user_info: Option<Value>,
    pub is_read_only: bool,
}

/// A fully visible peer: connection metadata plus presence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    #[serde(rename = "connectionId")]
    pub connection_id: i32,
    pub id: Option<String>,
    pub info: Option<Value>,
    pub presence: JsonObject,
    #[serde(rename = "isReadOnly")]
    pub is_read_only: bool,
}

#[derive(Debug, Default)]
struct OtherEntry {
    connection: Option<ConnectionMeta>,
    presence: Option<JsonObject>,
}

/// The per-actor map of peers. A peer is *visible* iff both connection
/// metadata and presence are known; only visible peers appear in the
/// projection handed to the host.
#[derive(Debug, Default)]
pub struct Others {
    entries: HashMap<i32, OtherEntry>,
    /// Lazily rebuilt projection of visible users, invalidated by any mutation.
    visible_cache: Option<Vec<User>>,
}

impl Others {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_connection(&mut self, meta: ConnectionMeta) {
        self.visible_cache = None;
        let connection_id = meta.connection_id;
        self.entries.entry(connection_id).or_default().connection = Some(meta);
    }

    /// Replaces a peer's presence wholesale (a keyframe).
    pub fn set_presence(&mut self, actor: i32, presence: JsonObject) {
        self.visible_cache = None;
        self.entries.entry(actor).or_default().presence = Some(presence);
    }

    /// Shallow-merges a presence patch; `null` values remove keys. Creates
    /// the presence record if the peer had none yet.
    pub fn patch_presence(&mut self, actor: i32, delta: &JsonObject) {
        self.visible_cache = None;
        let presence = self
            .entries
            .entry(actor)
            .or_default()
            .presence
            .get_or_insert_with(JsonObject::new);
        for (key, value) in delta {
            if value.is_null() {
                presence.shift_remove(key);
            } else {
                presence.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn remove(&mut self, actor: i32) {
        self.visible_cache = None;
        self.entries.remove(&actor);
    }

    /// Drops every peer not in `keep`.
    pub fn retain_actors(&mut self, keep: &[i32]) {
        self.visible_cache = None;
        self.entries.retain(|actor, _| keep.contains(actor));
    }

    pub fn clear(&mut self) {
        self.visible_cache = None;
        self.entries.clear();
    }

    pub fn has_connection(&self, actor: i32) -> bool {
        self.entries
            .get(&actor)
            .is_some_and(|e| e.connection.is_some())
    }

    pub fn has_presence(&self, actor: i32) -> bool {
        self.entries
            .get(&actor)
            .is_some_and(|e| e.presence.is_some())
    }

    pub fn is_visible(&self, actor: i32) -> bool {
        self.has_connection(actor) && self.has_presence(actor)
    }

    /// Snapshot of one peer, if visible.
    pub fn user(&self, actor: i32) -> Option<User> {
        let entry = self.entries.get(&actor)?;
        let connection = entry.connection.as_ref()?;
        let presence = entry.presence.as_ref()?;
        Some(User {
            connection_id: connection.connection_id,
            id: connection.user_id.clone(),
            info: connection.user_info.clone(),
            presence: presence.clone(),
            is_read_only: connection.is_read_only,
        })
    }

    /// The visible-users projection, ordered by connection id.
    pub fn visible_users(&mut self) -> Vec<User> {
        if self.visible_cache.is_none() {
            let mut users: Vec<User> = self
                .entries
                .keys()
                .copied()
                .filter_map(|actor| self.user(actor))
                .collect();
            users.sort_by_key(|u| u.connection_id);
            self.visible_cache = Some(users);
        }
        self.visible_cache.clone().unwrap_or_default()
    }
}
