// tests/integration/presence_test.rs

//! Presence flow: the initial keyframe, targeted sends to joiners, and the
//! visibility rules of the others collection.

use super::harness::*;
use liveroom::Room;
use liveroom::core::events::{OthersEvent, OthersEventKind};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::time::timeout;

async fn next_others(rx: &mut broadcast::Receiver<OthersEvent>) -> OthersEvent {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an others event")
        .expect("others channel closed")
}

#[tokio::test]
async fn initial_presence_flushes_as_one_keyframe() {
    let mut server = TestServer::start().await;
    let mut config = test_config(&server, 1, WRITE_SCOPES);
    config.initial_presence = obj(json!({ "color": "red" }));
    let room = Room::enter(config).unwrap();

    // Queued before the channel opens, so they coalesce into the keyframe.
    room.update_presence(obj(json!({ "x": 1 })), false);
    room.update_presence(obj(json!({ "y": 2 })), false);

    let mut conn = server.accept().await;
    let msg = conn.expect_message(100).await;
    assert_eq!(msg["targetActor"], json!(-1));
    assert_eq!(msg["data"], json!({ "color": "red", "x": 1, "y": 2 }));

    room.disconnect();
}

#[tokio::test]
async fn presence_patch_goes_out_without_target() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;

    room.update_presence(obj(json!({ "cursor": { "x": 10 } })), false);
    let msg = conn.expect_message(100).await;
    assert!(msg.get("targetActor").is_none());
    assert_eq!(msg["data"], json!({ "cursor": { "x": 10 } }));
    assert_eq!(room.my_presence(), obj(json!({ "cursor": { "x": 10 } })));

    room.disconnect();
}

#[tokio::test]
async fn joiner_gets_full_presence_and_becomes_visible_with_it() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let mut others_rx = room.subscribe_others();

    conn.send_json(json!({
        "type": 101, "actor": 2, "id": "user-2",
        "info": { "name": "User 2" },
        "scopes": ["room:read", "room:write", "room:presence:write"],
    }));

    // We answer a join with our full presence, sent directly to the joiner.
    let msg = conn.expect_message(100).await;
    assert_eq!(msg["targetActor"], json!(2));

    // Known but invisible until presence arrives.
    assert!(room.others().is_empty());

    conn.send_json(json!({ "type": 100, "actor": 2, "targetActor": 1, "data": { "x": 5 } }));
    let event = next_others(&mut others_rx).await;
    assert!(matches!(event.kind, OthersEventKind::Enter { .. }));
    assert_eq!(event.others.len(), 1);
    assert_eq!(event.others[0].connection_id, 2);
    assert_eq!(event.others[0].id.as_deref(), Some("user-2"));
    assert_eq!(event.others[0].presence, obj(json!({ "x": 5 })));

    room.disconnect();
}

#[tokio::test]
async fn presence_patch_updates_a_visible_peer() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let mut others_rx = room.subscribe_others();

    conn.send_json(json!({
        "type": 101, "actor": 2, "id": "user-2", "info": null,
        "scopes": ["room:read", "room:write", "room:presence:write"],
    }));
    conn.send_json(json!({ "type": 100, "actor": 2, "targetActor": 1, "data": { "x": 1 } }));
    let enter = next_others(&mut others_rx).await;
    assert!(matches!(enter.kind, OthersEventKind::Enter { .. }));

    conn.send_json(json!({ "type": 100, "actor": 2, "data": { "x": 2 } }));
    let update = next_others(&mut others_rx).await;
    match update.kind {
        OthersEventKind::Update { user, patch } => {
            assert_eq!(user.presence, obj(json!({ "x": 2 })));
            assert_eq!(patch, obj(json!({ "x": 2 })));
        }
        other => panic!("expected an update event, got {other:?}"),
    }

    room.disconnect();
}

#[tokio::test]
async fn presence_without_metadata_stays_invisible() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let mut others_rx = room.subscribe_others();

    let mut custom_rx = room.subscribe_custom();

    // Presence for an actor we never saw join: state is kept, nothing emits.
    conn.send_json(json!({ "type": 100, "actor": 9, "targetActor": 1, "data": { "x": 1 } }));
    conn.send_json(json!({ "type": 103, "actor": 9, "event": "marker" }));

    // The marker event proves the presence message was processed first.
    timeout(RECV_TIMEOUT, custom_rx.recv())
        .await
        .expect("timed out")
        .expect("custom channel closed");
    assert!(room.others().is_empty());
    assert!(others_rx.try_recv().is_err());

    room.disconnect();
}

#[tokio::test]
async fn user_left_emits_leave_only_when_visible() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let mut others_rx = room.subscribe_others();

    conn.send_json(json!({
        "type": 101, "actor": 2, "id": "user-2", "info": null,
        "scopes": ["room:read", "room:write", "room:presence:write"],
    }));
    conn.send_json(json!({ "type": 100, "actor": 2, "targetActor": 1, "data": {} }));
    let _enter = next_others(&mut others_rx).await;

    conn.send_json(json!({ "type": 102, "actor": 2 }));
    let leave = next_others(&mut others_rx).await;
    match leave.kind {
        OthersEventKind::Leave { user } => assert_eq!(user.connection_id, 2),
        other => panic!("expected a leave event, got {other:?}"),
    }
    assert!(leave.others.is_empty());

    room.disconnect();
}

#[tokio::test]
async fn room_state_reconciles_and_emits_one_reset() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let mut others_rx = room.subscribe_others();

    // Two visible peers.
    for actor in [2, 3] {
        conn.send_json(json!({
            "type": 101, "actor": actor, "id": format!("user-{actor}"), "info": null,
            "scopes": ["room:read", "room:write", "room:presence:write"],
        }));
        conn.send_json(json!({ "type": 100, "actor": actor, "targetActor": 1, "data": {} }));
        let _ = next_others(&mut others_rx).await;
    }
    assert_eq!(room.others().len(), 2);

    // The server's authoritative list no longer contains actor 3.
    conn.send_json(json!({
        "type": 104,
        "users": { "2": { "id": "user-2", "info": null, "scopes": ["room:read", "room:write", "room:presence:write"] } },
    }));
    let reset = next_others(&mut others_rx).await;
    assert!(matches!(reset.kind, OthersEventKind::Reset));
    assert_eq!(reset.others.len(), 1);
    assert_eq!(reset.others[0].connection_id, 2);

    room.disconnect();
}

#[tokio::test]
async fn broadcast_events_flow_both_ways() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let mut custom_rx = room.subscribe_custom();

    room.broadcast_event(json!({ "emoji": "🎉" }), false);
    let msg = conn.expect_message(103).await;
    assert_eq!(msg["event"], json!({ "emoji": "🎉" }));

    conn.send_json(json!({ "type": 103, "actor": 2, "event": { "emoji": "🔥" } }));
    let event = timeout(RECV_TIMEOUT, custom_rx.recv())
        .await
        .expect("timed out")
        .expect("custom channel closed");
    assert_eq!(event.connection_id, 2);
    assert_eq!(event.event, json!({ "emoji": "🔥" }));

    room.disconnect();
}

#[tokio::test]
async fn read_only_sessions_can_write_presence_but_not_storage() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, READ_ONLY_SCOPES).await;

    assert!(room.self_session().unwrap().is_read_only);

    let err = room
        .update_object("0:0", obj(json!({ "a": 1 })))
        .unwrap_err();
    assert_eq!(err, liveroom::RoomError::WriteDenied);

    room.update_presence(obj(json!({ "x": 1 })), false);
    let msg = conn.expect_message(100).await;
    assert_eq!(msg["data"], json!({ "x": 1 }));

    room.disconnect();
}

#[tokio::test]
async fn null_presence_values_remove_keys() {
    let mut server = TestServer::start().await;
    let (room, _conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;

    room.update_presence(obj(json!({ "x": 1, "y": 2 })), false);
    room.update_presence(obj(json!({ "x": Value::Null })), false);
    assert_eq!(room.my_presence(), obj(json!({ "y": 2 })));

    room.disconnect();
}
