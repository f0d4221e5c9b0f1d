// tests/integration/storage_test.rs

//! Storage lifecycle: loading the root, batched mutations, initial-storage
//! defaults, remote op application, and node-scoped subscriptions.

use super::harness::*;
use liveroom::core::crdt::StorageUpdateKind;
use liveroom::core::events::SubscriptionDepth;
use liveroom::core::room::StorageStatus;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn storage_loads_and_reports_status() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;

    assert_eq!(room.storage_status(), StorageStatus::NotLoaded);
    let root = load_storage(&room, &mut conn, root_items(json!({ "a": 0, "b": 0 }))).await;
    assert_eq!(root, "0:0");
    assert_eq!(room.storage_status(), StorageStatus::Synchronized);
    assert_eq!(room.render_storage(), Some(json!({ "a": 0, "b": 0 })));

    room.disconnect();
}

#[tokio::test]
async fn batch_collapses_updates_and_ops() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let root = load_storage(&room, &mut conn, root_items(json!({ "a": 0, "b": 0 }))).await;

    let mut storage_rx = room.subscribe_storage();
    room.batch(|| {
        room.update_object(&root, obj(json!({ "a": 1 }))).unwrap();
        room.update_object(&root, obj(json!({ "b": 1 }))).unwrap();
    });

    // Observers get exactly one emission with the per-node merged update.
    let batch = timeout(RECV_TIMEOUT, storage_rx.recv())
        .await
        .expect("timed out")
        .expect("storage channel closed");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].node_id, root);
    match &batch[0].kind {
        StorageUpdateKind::Object { updates } => {
            assert_eq!(updates.len(), 2);
            assert!(updates.contains_key("a") && updates.contains_key("b"));
        }
        other => panic!("expected an object update, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(storage_rx.try_recv().is_err());

    // The wire sees one storage message with exactly the two ops.
    let msg = conn.expect_message(201).await;
    assert_eq!(ops_of(&msg).len(), 2);
    assert_eq!(room.render_storage(), Some(json!({ "a": 1, "b": 1 })));

    room.disconnect();
}

#[tokio::test]
async fn remote_create_then_mutate_collapses_descendant_updates() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let root = load_storage(&room, &mut conn, root_items(json!({}))).await;

    let mut storage_rx = room.subscribe_storage();
    // One remote frame creates a node and immediately mutates it.
    conn.send_json(json!({
        "type": 201,
        "ops": [
            { "type": 4, "opId": "9:0", "id": "9:1", "parentId": root, "parentKey": "child", "data": {} },
            { "type": 3, "opId": "9:2", "id": "9:1", "data": { "x": 1 } },
        ],
    }));

    // Only the parent sees an update; the fresh child's state travels with
    // its creation.
    let batch = timeout(RECV_TIMEOUT, storage_rx.recv())
        .await
        .expect("timed out")
        .expect("storage channel closed");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].node_id, root);
    assert_eq!(
        room.render_storage(),
        Some(json!({ "child": { "x": 1 } }))
    );

    room.disconnect();
}

#[tokio::test]
async fn initial_storage_defaults_seed_missing_keys() {
    let mut server = TestServer::start().await;
    let mut config = test_config(&server, 1, WRITE_SCOPES);
    config.initial_storage = obj(json!({ "counter": 0, "a": 99 }));
    let (room, mut conn) = connect_room(&mut server, config).await;

    let root = load_storage(&room, &mut conn, root_items(json!({ "a": 0 }))).await;
    // "a" was present and keeps its value; "counter" gets seeded and synced.
    assert_eq!(room.render_storage(), Some(json!({ "a": 0, "counter": 0 })));
    let msg = conn.expect_message(201).await;
    let ops = ops_of(&msg);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["type"], json!(3));
    assert_eq!(ops[0]["id"], json!(root));
    assert_eq!(ops[0]["data"], json!({ "counter": 0 }));

    room.disconnect();
}

#[tokio::test]
async fn remote_ops_apply_and_notify() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let root = load_storage(&room, &mut conn, root_items(json!({ "a": 0 }))).await;

    let mut storage_rx = room.subscribe_storage();
    conn.send_json(json!({
        "type": 201,
        "ops": [{ "type": 3, "opId": "9:1", "id": root, "data": { "a": 7 } }],
    }));

    let batch = timeout(RECV_TIMEOUT, storage_rx.recv())
        .await
        .expect("timed out")
        .expect("storage channel closed");
    assert_eq!(batch[0].node_id, root);
    assert_eq!(room.render_storage(), Some(json!({ "a": 7 })));

    room.disconnect();
}

#[tokio::test]
async fn node_subscriptions_filter_by_depth() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let root = load_storage(&room, &mut conn, root_items(json!({}))).await;

    let child = room.create_object(&root, "child", obj(json!({}))).unwrap();
    let mut shallow_root = room.subscribe_node(&root, SubscriptionDepth::Shallow);
    let mut deep_root = room.subscribe_node(&root, SubscriptionDepth::Deep);

    // A remote update on the nested child reaches only the deep scope.
    conn.send_json(json!({
        "type": 201,
        "ops": [{ "type": 3, "opId": "9:1", "id": child, "data": { "x": 1 } }],
    }));

    let deep = timeout(RECV_TIMEOUT, deep_root.recv())
        .await
        .expect("timed out")
        .expect("storage channel closed");
    assert_eq!(deep.len(), 1);
    assert_eq!(deep[0].node_id, child);

    // The shallow scope keeps waiting: nothing touched the root itself.
    let silent = timeout(Duration::from_millis(100), shallow_root.recv()).await;
    assert!(silent.is_err());

    room.disconnect();
}

#[tokio::test]
async fn object_key_deletion_round_trips() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let root = load_storage(&room, &mut conn, root_items(json!({ "a": 1, "b": 2 }))).await;

    room.delete_object_key(&root, "a").unwrap();
    assert_eq!(room.render_storage(), Some(json!({ "b": 2 })));
    let msg = conn.expect_message(201).await;
    assert_eq!(ops_of(&msg)[0]["type"], json!(6));

    room.undo().unwrap();
    assert_eq!(room.render_storage(), Some(json!({ "b": 2, "a": 1 })));

    room.disconnect();
}

#[tokio::test]
async fn nested_nodes_render_and_delete_as_subtrees() {
    let mut server = TestServer::start().await;
    let (room, mut conn) = connect_ready(&mut server, 1, WRITE_SCOPES).await;
    let root = load_storage(&room, &mut conn, root_items(json!({}))).await;

    let board = room.create_object(&root, "board", obj(json!({ "title": "Plan" }))).unwrap();
    let items = room.create_list(&board, "items").unwrap();
    room.push_list_item(&items, json!("first")).unwrap();
    room.push_list_item(&items, json!("second")).unwrap();
    assert_eq!(
        room.render_storage(),
        Some(json!({ "board": { "title": "Plan", "items": ["first", "second"] } }))
    );

    room.delete_node(&board).unwrap();
    assert_eq!(room.render_storage(), Some(json!({})));

    // Undo restores the whole subtree.
    room.undo().unwrap();
    assert_eq!(
        room.render_storage(),
        Some(json!({ "board": { "title": "Plan", "items": ["first", "second"] } }))
    );

    room.disconnect();
}
