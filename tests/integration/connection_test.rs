// tests/integration/connection_test.rs

//! The connection state machine end-to-end: session identity, ack
//! bookkeeping, reconnect resend, close-code handling, and heartbeats.

use super::harness::*;
use liveroom::RoomError;
use liveroom::core::room::{ConnectionStatus, StorageStatus};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

async fn wait_for_status(room: &liveroom::Room, wanted: ConnectionStatus) {
    timeout(RECV_TIMEOUT, async {
        loop {
            if room.connection_status() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room never reached status {wanted}"));
}

#[tokio::test]
async fn session_identity_comes_from_the_token() {
    let mut server = TestServer::start().await;
    let (room, _conn) = connect_ready(&mut server, 7, WRITE_SCOPES).await;

    wait_for_status(&room, ConnectionStatus::Open).await;
    let session = room.self_session().unwrap();
    assert_eq!(session.actor, 7);
    assert_eq!(session.user_id.as_deref(), Some("user-7"));
    assert!(!session.is_read_only);

    room.disconnect();
    wait_for_status(&room, ConnectionStatus::Closed).await;
}

#[tokio::test]
async fn acked_ops_leave_the_ledger_and_status_settles() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let root = load_storage(&room, &mut conn, root_items(json!({ "a": 0 }))).await;
    let mut status_rx = room.subscribe_storage_status();

    room.update_object(&root, obj(json!({ "a": 1 }))).unwrap();
    // Dispatch put the op into the ledger: storage is now synchronizing.
    let status = timeout(RECV_TIMEOUT, status_rx.recv()).await.unwrap().unwrap();
    assert_eq!(status, StorageStatus::Synchronizing);

    let msg = conn.expect_message(201).await;
    let ops = ops_of(&msg);
    assert_eq!(ops.len(), 1);
    let op_id = ops[0]["opId"].as_str().unwrap().to_string();

    conn.send_json(json!({ "type": 201, "ops": [{ "type": 9, "opId": op_id }] }));
    let status = timeout(RECV_TIMEOUT, status_rx.recv()).await.unwrap().unwrap();
    assert_eq!(status, StorageStatus::Synchronized);
    // The ack itself must not touch the replica.
    assert_eq!(room.render_storage(), Some(json!({ "a": 1 })));

    room.disconnect();
}

#[tokio::test]
async fn unacked_ops_resend_once_after_reconnect() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let root = load_storage(&room, &mut conn, root_items(json!({ "a": 0 }))).await;

    room.update_object(&root, obj(json!({ "a": 1 }))).unwrap();
    let msg = conn.expect_message(201).await;
    let op_id = ops_of(&msg)[0]["opId"].as_str().unwrap().to_string();

    // The server dies without acking.
    conn.close(1001, "going away");

    let mut conn2 = server.accept().await;
    // Reconnection starts with a presence keyframe and a storage resync.
    let keyframe = conn2.expect_message(100).await;
    assert_eq!(keyframe["targetActor"], json!(-1));
    conn2.expect_message(200).await;
    conn2.send_json(json!({ "type": 200, "items": root_items(json!({ "a": 0 })) }));

    // Exactly one storage frame, carrying the unacked op under its
    // original opId.
    let resend = conn2.expect_message(201).await;
    let ops = ops_of(&resend);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["opId"].as_str(), Some(op_id.as_str()));
    assert!(conn2.assert_silent(Duration::from_millis(200)).await);

    // The local edit survived the baseline reload.
    assert_eq!(room.render_storage(), Some(json!({ "a": 1 })));

    room.disconnect();
}

#[tokio::test]
async fn close_without_retry_ends_the_session() {
    let mut server = TestServer::start().await;
    let (room, conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;

    conn.close(4999, "bye");
    wait_for_status(&room, ConnectionStatus::Closed).await;
    assert!(server.assert_no_connection(Duration::from_millis(300)).await);

    room.disconnect();
}

#[tokio::test]
async fn rejection_close_codes_surface_an_error_then_retry() {
    let mut server = TestServer::start().await;
    let mut config = test_config(&server, 1, WRITE_SCOPES);
    config.backoff.slow_retry_delays_ms = vec![50];
    let room = liveroom::Room::enter(config).unwrap();
    let conn = server.accept().await;
    let mut error_rx = room.subscribe_error();

    conn.close(4042, "unauthorized");
    let err = timeout(RECV_TIMEOUT, error_rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        err,
        RoomError::Rejected {
            code: 4042,
            reason: "unauthorized".into(),
        }
    );

    // It still reconnects, on the slow schedule.
    let _conn2 = server.accept().await;

    room.disconnect();
}

#[tokio::test]
async fn heartbeats_keep_the_channel_alive() {
    let mut server = TestServer::start().await;
    let mut config = test_config(&server, 1, WRITE_SCOPES);
    config.heartbeat_interval = Duration::from_millis(50);
    config.pong_timeout = Duration::from_millis(500);
    let (room, _conn) = connect_room(&mut server, config).await;

    wait_for_status(&room, ConnectionStatus::Open).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    // Several heartbeat rounds later the channel is still the first one.
    assert_eq!(room.connection_status(), ConnectionStatus::Open);
    assert!(server.assert_no_connection(Duration::from_millis(100)).await);

    room.disconnect();
}

#[tokio::test]
async fn missing_pongs_force_a_reconnect() {
    let mut server = TestServer::start_with(false).await;
    let mut config = test_config(&server, 1, WRITE_SCOPES);
    config.heartbeat_interval = Duration::from_millis(50);
    config.pong_timeout = Duration::from_millis(50);
    let (room, _conn) = connect_room(&mut server, config).await;

    wait_for_status(&room, ConnectionStatus::Open).await;
    // The silent server fails the pong deadline; a second channel appears.
    let _conn2 = server.accept().await;

    room.disconnect();
}

#[tokio::test]
async fn manual_reconnect_tears_down_the_channel() {
    let mut server = TestServer::start().await;
    let (room, _conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;

    wait_for_status(&room, ConnectionStatus::Open).await;
    room.reconnect();
    let mut conn2 = server.accept().await;
    // The fresh channel re-sends the full presence keyframe.
    let keyframe = conn2.expect_message(100).await;
    assert_eq!(keyframe["targetActor"], json!(-1));
    wait_for_status(&room, ConnectionStatus::Open).await;

    room.disconnect();
}

#[tokio::test]
async fn disconnect_closes_event_subscriptions() {
    let mut server = TestServer::start().await;
    let (room, _conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let mut error_rx = room.subscribe_error();

    room.disconnect();
    let next = timeout(RECV_TIMEOUT, error_rx.recv()).await.unwrap();
    assert!(matches!(
        next,
        Err(tokio::sync::broadcast::error::RecvError::Closed)
    ));
}

#[tokio::test]
async fn queued_broadcasts_survive_until_the_channel_opens() {
    let mut server = TestServer::start().await;
    let config = test_config(&server, 1, WRITE_SCOPES);
    let room = liveroom::Room::enter(config).unwrap();

    // Not open yet: dropped without the queue flag, kept with it.
    room.broadcast_event(json!({ "n": 1 }), false);
    room.broadcast_event(json!({ "n": 2 }), true);

    let mut conn = server.accept().await;
    let msg = conn.expect_message(103).await;
    assert_eq!(msg["event"], json!({ "n": 2 }));
    assert!(conn.assert_silent(Duration::from_millis(200)).await);

    room.disconnect();
}
