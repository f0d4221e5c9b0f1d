// src/auth/mod.rs

//! Token acquisition: the auth endpoint client and the custom-provider hook.
//!
//! Three modes are recognized: public (POST with the public API key),
//! private (POST with cookies included), and custom (the host callback).
//! All of them yield `{token}` or fail with an authentication error.

pub mod token;

use crate::config::{AuthConfig, RoomConfig};
use crate::core::errors::RoomError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

pub use token::AccessToken;

/// The auth endpoint's (or provider's) successful response.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub token: String,
}

/// Host-supplied token source for [`AuthConfig::Custom`].
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authorize(&self, room_id: &str) -> Result<AuthResponse, RoomError>;
}

/// Obtains and parses a token for the configured room.
pub async fn authenticate(config: &RoomConfig) -> Result<AccessToken, RoomError> {
    let response = match &config.auth {
        AuthConfig::Public {
            endpoint,
            public_api_key,
        } => {
            post_json(
                endpoint,
                json!({ "room": config.room_id, "publicApiKey": public_api_key }),
                false,
            )
            .await?
        }
        AuthConfig::Private { endpoint } => {
            post_json(endpoint, json!({ "room": config.room_id }), true).await?
        }
        AuthConfig::Custom => {
            let provider = config.hooks.auth_provider().ok_or_else(|| {
                RoomError::Authentication("custom auth mode without a provider".into())
            })?;
            provider.authorize(&config.room_id).await?
        }
    };
    debug!("Obtained access token for room '{}'", config.room_id);
    AccessToken::parse(&response.token)
}

async fn post_json(
    endpoint: &Url,
    body: Value,
    with_cookies: bool,
) -> Result<AuthResponse, RoomError> {
    let client = reqwest::Client::builder()
        .cookie_store(with_cookies)
        .build()
        .map_err(|err| RoomError::Internal(format!("failed to build HTTP client: {err}")))?;
    let response = client
        .post(endpoint.clone())
        .json(&body)
        .send()
        .await
        .map_err(|err| RoomError::Authentication(format!("auth endpoint unreachable: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(RoomError::Authentication(format!(
            "auth endpoint returned {status}"
        )));
    }
    response.json::<AuthResponse>().await.map_err(|err| {
        RoomError::Authentication(format!("auth endpoint returned a malformed body: {err}"))
    })
}
