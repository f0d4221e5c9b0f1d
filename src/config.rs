// src/config.rs

//! Room configuration: connection endpoints, auth mode, flush throttling,
//! and the initial presence/storage payloads.

use crate::auth::AuthProvider;
use crate::core::errors::RoomError;
use crate::core::events::{BatchUpdatesFn, passthrough_batch_updates};
use crate::core::protocol::JsonObject;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// How the room obtains its access token.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum AuthConfig {
    /// POST `{room, publicApiKey}` to the endpoint.
    Public {
        endpoint: Url,
        public_api_key: String,
    },
    /// POST `{room}` to the endpoint, with cookies included.
    Private { endpoint: Url },
    /// Invoke the host-supplied [`AuthProvider`] from [`RoomHooks`].
    Custom,
}

/// Reconnect schedules, indexed by retry count and saturating at the last
/// entry. The slow schedule applies after explicit server rejections.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackoffConfig {
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
    #[serde(default = "default_slow_retry_delays_ms")]
    pub slow_retry_delays_ms: Vec<u64>,
}

impl BackoffConfig {
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn slow_retry_delays(&self) -> Vec<Duration> {
        self.slow_retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            retry_delays_ms: default_retry_delays_ms(),
            slow_retry_delays_ms: default_slow_retry_delays_ms(),
        }
    }
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![250, 500, 1000, 2000, 4000, 8000, 10000]
}

fn default_slow_retry_delays_ms() -> Vec<u64> {
    vec![2000, 30000, 60000, 300000]
}

/// Host-supplied callbacks that cannot be expressed in serialized
/// configuration.
#[derive(Clone, Default)]
pub struct RoomHooks {
    batch_updates: Option<BatchUpdatesFn>,
    auth_provider: Option<Arc<dyn AuthProvider>>,
}

impl RoomHooks {
    /// Wraps every event emission group, letting UI frameworks coalesce
    /// renders. Defaults to a pass-through.
    pub fn with_batch_updates(mut self, wrapper: BatchUpdatesFn) -> Self {
        self.batch_updates = Some(wrapper);
        self
    }

    /// Token source for [`AuthConfig::Custom`].
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    pub(crate) fn batch_updates(&self) -> BatchUpdatesFn {
        self.batch_updates
            .clone()
            .unwrap_or_else(passthrough_batch_updates)
    }

    pub(crate) fn auth_provider(&self) -> Option<Arc<dyn AuthProvider>> {
        self.auth_provider.clone()
    }
}

impl std::fmt::Debug for RoomHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHooks")
            .field("batch_updates", &self.batch_updates.is_some())
            .field("auth_provider", &self.auth_provider.is_some())
            .finish()
    }
}

/// Full configuration of one room session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RoomConfig {
    pub room_id: String,
    /// WebSocket endpoint of the coordination server (`ws://` or `wss://`;
    /// `http(s)` is mapped).
    pub server: Url,
    pub auth: AuthConfig,
    /// Minimum interval between outbound frames.
    #[serde(with = "humantime_serde", default = "default_throttle")]
    pub throttle: Duration,
    #[serde(default)]
    pub initial_presence: JsonObject,
    /// Root keys seeded whenever initial storage loads without them.
    #[serde(default)]
    pub initial_storage: JsonObject,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_pong_timeout")]
    pub pong_timeout: Duration,
    #[serde(skip)]
    pub hooks: RoomHooks,
}

fn default_throttle() -> Duration {
    Duration::from_millis(100)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_pong_timeout() -> Duration {
    Duration::from_secs(2)
}

impl RoomConfig {
    pub fn new(room_id: impl Into<String>, server: Url, auth: AuthConfig) -> Self {
        Self {
            room_id: room_id.into(),
            server,
            auth,
            throttle: default_throttle(),
            initial_presence: JsonObject::new(),
            initial_storage: JsonObject::new(),
            backoff: BackoffConfig::default(),
            heartbeat_interval: default_heartbeat_interval(),
            pong_timeout: default_pong_timeout(),
            hooks: RoomHooks::default(),
        }
    }

    /// Loads a configuration from a JSON file. Hooks must be attached
    /// afterwards.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("Failed to read config file {path}"))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {path}"))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RoomError> {
        if self.room_id.is_empty() {
            return Err(RoomError::Internal("room_id must not be empty".into()));
        }
        match self.server.scheme() {
            "ws" | "wss" | "http" | "https" => {}
            other => {
                return Err(RoomError::Internal(format!(
                    "unsupported server scheme '{other}'"
                )));
            }
        }
        if self.throttle < Duration::from_millis(16) || self.throttle > Duration::from_secs(1) {
            return Err(RoomError::Internal(
                "throttle must be between 16ms and 1s".into(),
            ));
        }
        if self.backoff.retry_delays_ms.is_empty() || self.backoff.slow_retry_delays_ms.is_empty() {
            return Err(RoomError::Internal(
                "backoff schedules must not be empty".into(),
            ));
        }
        if matches!(self.auth, AuthConfig::Custom) && self.hooks.auth_provider().is_none() {
            return Err(RoomError::Internal(
                "custom auth mode requires an auth provider hook".into(),
            ));
        }
        Ok(())
    }
}
