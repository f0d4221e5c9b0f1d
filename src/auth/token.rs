// src/auth/token.rs

//! Access-token parsing and scope interpretation.
//!
//! The client treats the token as an opaque signed bearer but inspects its
//! claims: the actor id, the permission scopes, optional user identity, and
//! the expiry timestamps. Signature validation is the server's job.

use crate::core::errors::RoomError;
use crate::core::room::SessionInfo;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

pub const SCOPE_ROOM_READ: &str = "room:read";
pub const SCOPE_ROOM_WRITE: &str = "room:write";
pub const SCOPE_PRESENCE_WRITE: &str = "room:presence:write";

/// Tolerated clock skew when judging expiry.
pub const TOKEN_EXPIRY_SKEW_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct Claims {
    actor: i32,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    info: Option<Value>,
    exp: u64,
    iat: u64,
}

/// A parsed access token plus its raw form for the wire.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub raw: String,
    pub actor: i32,
    pub scopes: BTreeSet<String>,
    pub id: Option<String>,
    pub info: Option<Value>,
    pub exp: u64,
    pub iat: u64,
}

impl AccessToken {
    /// Parses the claims segment of a three-part dotted token.
    pub fn parse(raw: &str) -> Result<Self, RoomError> {
        let parts: Vec<&str> = raw.split('.').collect();
        let [_, payload, _] = parts.as_slice() else {
            return Err(RoomError::Authentication(
                "malformed token: expected three dot-separated segments".into(),
            ));
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|err| {
                RoomError::Authentication(format!("malformed token payload: {err}"))
            })?;
        let claims: Claims = serde_json::from_slice(&bytes)
            .map_err(|err| RoomError::Authentication(format!("malformed token claims: {err}")))?;
        Ok(Self {
            raw: raw.to_string(),
            actor: claims.actor,
            scopes: claims.scopes.into_iter().collect(),
            id: claims.id,
            info: claims.info,
            exp: claims.exp,
            iat: claims.iat,
        })
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        now_secs >= self.exp.saturating_sub(TOKEN_EXPIRY_SKEW_SECS)
    }

    pub fn is_expired_now(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.is_expired(now)
    }

    /// Read-only iff the token grants reading and presence writes but not
    /// storage writes.
    pub fn is_read_only(&self) -> bool {
        self.scopes.contains(SCOPE_ROOM_READ)
            && self.scopes.contains(SCOPE_PRESENCE_WRITE)
            && !self.scopes.contains(SCOPE_ROOM_WRITE)
    }

    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            actor: self.actor,
            user_id: self.id.clone(),
            user_info: self.info.clone(),
            is_read_only: self.is_read_only(),
        }
    }
}

/// The same read-only derivation for peer scope lists from the wire.
pub fn scopes_imply_read_only(scopes: &[String]) -> bool {
    let has = |scope: &str| scopes.iter().any(|s| s == scope);
    has(SCOPE_ROOM_READ) && has(SCOPE_PRESENCE_WRITE) && !has(SCOPE_ROOM_WRITE)
}
