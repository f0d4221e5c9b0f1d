// src/connection/websocket.rs

//! WebSocket channel establishment: URL building and the TLS-capable
//! connect. Frame pumping lives in the connection worker.

use crate::core::errors::RoomError;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds the channel URL: `{server}/?token={raw}&version={crate version}`.
/// `http(s)` schemes are mapped to their WebSocket equivalents. No
/// subprotocol negotiation is used.
pub fn channel_url(server: &Url, token: &str) -> Result<Url, RoomError> {
    let mut url = server.clone();
    let scheme = match server.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => {
            return Err(RoomError::Channel(format!(
                "unsupported channel scheme '{other}'"
            )));
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| RoomError::Channel("failed to set channel scheme".into()))?;
    }
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("version", env!("CARGO_PKG_VERSION"));
    Ok(url)
}

/// Opens the channel for the given raw token.
pub async fn connect(server: &Url, token: &str) -> Result<WsStream, RoomError> {
    let url = channel_url(server, token)?;
    let (stream, _response) = connect_async(url.as_str())
        .await
        .map_err(|err| RoomError::Channel(err.to_string()))?;
    Ok(stream)
}
