// tests/integration/harness.rs

//! Common fixtures for integration tests: a loopback WebSocket server the
//! room connects to, plus token forging for the custom auth provider.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::{SinkExt, StreamExt};
use liveroom::Room;
use liveroom::auth::{AuthProvider, AuthResponse};
use liveroom::config::{AuthConfig, RoomConfig};
use liveroom::core::errors::RoomError;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Scopes granting full access.
pub const WRITE_SCOPES: &[&str] = &["room:read", "room:write", "room:presence:write"];
/// Scopes granting presence-only access.
pub const READ_ONLY_SCOPES: &[&str] = &["room:read", "room:presence:write"];

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Builds an unsigned three-segment token the client will accept; the client
/// never verifies signatures.
pub fn forge_token(actor: i32, scopes: &[&str]) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let claims = json!({
        "actor": actor,
        "scopes": scopes,
        "id": format!("user-{actor}"),
        "info": { "name": format!("User {actor}") },
        "iat": now_secs(),
        "exp": now_secs() + 3600,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

struct StaticAuth {
    token: String,
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn authorize(&self, _room_id: &str) -> Result<AuthResponse, RoomError> {
        Ok(AuthResponse {
            token: self.token.clone(),
        })
    }
}

enum ServerCommand {
    Send(String),
    Close(u16, String),
}

/// One accepted client connection, seen from the server side.
pub struct ServerConn {
    frames: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<ServerCommand>,
    /// Messages already read from a multi-message frame but not consumed.
    pending: std::collections::VecDeque<Value>,
}

impl ServerConn {
    /// The next text frame, parsed as JSON. Heartbeat pings never show up
    /// here; the server answers them on its own when auto-pong is on.
    pub async fn next_frame(&mut self) -> Value {
        let text = timeout(RECV_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("server connection closed");
        serde_json::from_str(&text).expect("frame is not JSON")
    }

    /// The next message, unwrapping multi-message frames.
    pub async fn next_message(&mut self) -> Value {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return msg;
            }
            match self.next_frame().await {
                Value::Array(items) => self.pending.extend(items),
                obj => return obj,
            }
        }
    }

    /// Skips messages until one with the given `type` arrives.
    pub async fn expect_message(&mut self, msg_type: u64) -> Value {
        loop {
            let msg = self.next_message().await;
            if msg.get("type").and_then(Value::as_u64) == Some(msg_type) {
                return msg;
            }
        }
    }

    /// True if nothing arrives within `wait`.
    pub async fn assert_silent(&mut self, wait: Duration) -> bool {
        self.pending.is_empty() && timeout(wait, self.frames.recv()).await.is_err()
    }

    pub fn send_json(&self, value: Value) {
        self.commands
            .send(ServerCommand::Send(value.to_string()))
            .expect("server connection task is gone");
    }

    #[allow(dead_code)] // Available for tests that need non-JSON frames
    pub fn send_raw(&self, text: &str) {
        self.commands
            .send(ServerCommand::Send(text.to_string()))
            .expect("server connection task is gone");
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.commands
            .send(ServerCommand::Close(code, reason.to_string()))
            .expect("server connection task is gone");
    }
}

/// A loopback coordination server accepting any number of connections.
pub struct TestServer {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ServerConn>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// `auto_pong: false` makes the server ignore heartbeats, which drives
    /// the client into its pong timeout.
    pub async fn start_with(auto_pong: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test server");
        let addr = listener.local_addr().unwrap();
        let (conn_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                let (frames_tx, frames_rx) = mpsc::unbounded_channel();
                let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                if conn_tx
                    .send(ServerConn {
                        frames: frames_rx,
                        commands: commands_tx,
                        pending: Default::default(),
                    })
                    .is_err()
                {
                    return;
                }
                tokio::spawn(drive_connection(ws, frames_tx, commands_rx, auto_pong));
            }
        });

        Self { addr, connections }
    }

    /// Waits for the next client connection.
    pub async fn accept(&mut self) -> ServerConn {
        timeout(RECV_TIMEOUT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("listener task is gone")
    }

    /// True if no client connects within `wait`.
    pub async fn assert_no_connection(&mut self, wait: Duration) -> bool {
        timeout(wait, self.connections.recv()).await.is_err()
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://{}", self.addr)).unwrap()
    }
}

async fn drive_connection(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    frames_tx: mpsc::UnboundedSender<String>,
    mut commands_rx: mpsc::UnboundedReceiver<ServerCommand>,
    auto_pong: bool,
) {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if text == "ping" {
                        if auto_pong {
                            let _ = write.send(Message::Text("pong".into())).await;
                        }
                    } else if frames_tx.send(text).is_err() {
                        return;
                    }
                }
                Some(Ok(_)) => {}
                _ => return,
            },
            command = commands_rx.recv() => match command {
                Some(ServerCommand::Send(text)) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Some(ServerCommand::Close(code, reason)) => {
                    let _ = write
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    return;
                }
                None => return,
            },
        }
    }
}

/// A room config pointed at the test server, tuned for fast tests.
pub fn test_config(server: &TestServer, actor: i32, scopes: &[&str]) -> RoomConfig {
    let mut config = RoomConfig::new("test-room", server.url(), AuthConfig::Custom);
    config.throttle = Duration::from_millis(20);
    config.backoff.retry_delays_ms = vec![30, 30, 30];
    config.backoff.slow_retry_delays_ms = vec![60, 60];
    config.hooks = config.hooks.clone().with_auth_provider(Arc::new(StaticAuth {
        token: forge_token(actor, scopes),
    }));
    config
}

/// Enters a room against the server and returns it together with the
/// server-side connection.
pub async fn connect_room(server: &mut TestServer, config: RoomConfig) -> (Room, ServerConn) {
    let room = Room::enter(config).expect("failed to enter room");
    let conn = server.accept().await;
    (room, conn)
}

/// Storage items for a root object with the given plain-JSON fields.
pub fn root_items(fields: Value) -> Value {
    json!([["0:0", { "type": 0, "data": fields }]])
}

/// Kicks off loading, serves `items`, and returns the root node id.
pub async fn load_storage(room: &Room, conn: &mut ServerConn, items: Value) -> String {
    room.storage_snapshot();
    conn.expect_message(200).await; // the storage fetch request
    conn.send_json(json!({ "type": 200, "items": items }));
    room.storage().await.expect("storage failed to load")
}

/// Shorthand for building a presence/data object from a JSON literal.
pub fn obj(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().expect("expected a JSON object")
}

/// Like [`connect_room`], but builds a default config and also consumes the
/// initial presence keyframe the room sends right after opening.
pub async fn connect_ready(
    server: &mut TestServer,
    actor: i32,
    scopes: &[&str],
) -> (Room, ServerConn) {
    let config = test_config(server, actor, scopes);
    let (room, mut conn) = connect_room(server, config).await;
    let keyframe = conn.expect_message(100).await;
    assert_eq!(keyframe.get("targetActor").and_then(Value::as_i64), Some(-1));
    (room, conn)
}

/// Extracts the `ops` array from an `UPDATE_STORAGE` message.
pub fn ops_of(msg: &Value) -> Vec<Value> {
    msg.get("ops")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}
