// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Failure-path scenarios: pruning, tampering, admission control.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::common::Node;
use entgl_core::{Hlc, Store};
use entgl_net::frame::{write_frame, DEFAULT_MAX_FRAME_BYTES};
use entgl_net::handshake::{initiate, NodeKeys};
use entgl_net::SyncMessage;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn new_node_joins_pruned_peer_via_snapshot() {
    let a = Node::start_sqlite("a", "t0k3n").await;
    let d = Node::start_sqlite("d", "t0k3n").await;

    for i in 0..10 {
        a.db.put("users", &format!("u{i}"), json!({"i": i})).unwrap();
    }
    let entries = a.db.store().oplog_for_node_after("a", &Hlc::zero(), None).unwrap();

    // Prune everything below the tip; the boundary metadata remains
    a.db.store().prune_oplog(&entries[9].timestamp).unwrap();
    assert!(a.db.store().snapshot_metadata("a").unwrap().is_some());

    let stats = d.session_to(&a).run_once().await.unwrap();
    assert!(stats.snapshot_fallback);

    for i in 0..10 {
        assert!(d.db.get("users", &format!("u{i}")).unwrap().is_some(), "missing u{i}");
    }
    assert_eq!(d.db.vector_clock().unwrap(), a.db.vector_clock().unwrap());

    a.shutdown();
    d.shutdown();
}

#[tokio::test]
async fn peer_with_matching_boundary_syncs_incrementally() {
    let a = Node::start("a", "t0k3n").await;
    let d = Node::start("d", "t0k3n").await;

    for i in 0..5 {
        a.db.put("users", &format!("u{i}"), json!({"i": i})).unwrap();
    }
    let entries = a.db.store().oplog_for_node_after("a", &Hlc::zero(), None).unwrap();
    a.db.store().prune_oplog(&entries[4].timestamp).unwrap();

    // D carries the same boundary, as if restored from an old snapshot
    let boundary = a.db.store().snapshot_metadata("a").unwrap().unwrap();
    d.db.store().update_snapshot_metadata(&boundary).unwrap();

    let stats = d.session_to(&a).run_once().await.unwrap();
    assert!(!stats.snapshot_fallback);
    assert_eq!(stats.pulled, 1);

    a.shutdown();
    d.shutdown();
}

#[tokio::test]
async fn tampered_ciphertext_never_surfaces_plaintext() {
    let server = Node::start("server", "t0k3n").await;

    let mut stream = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let keys = NodeKeys::generate();
    let mut cipher = initiate(&mut stream, &keys, DEFAULT_MAX_FRAME_BYTES).await.unwrap();

    let hello = SyncMessage::Hello { node_id: "x".into(), auth_token: "t0k3n".into() };
    let mut wire = Vec::new();
    write_frame(
        &mut wire,
        Some(&mut cipher),
        hello.msg_type(),
        &serde_json::to_vec(&hello).unwrap(),
        DEFAULT_MAX_FRAME_BYTES,
    )
    .await
    .unwrap();

    // Flip one ciphertext byte
    let target = wire.len() - 10;
    wire[target] ^= 0x01;
    stream.write_all(&wire).await.unwrap();

    // The connection must close with no response at all
    let mut buffer = [0u8; 64];
    let read = tokio::time::timeout(
        std::time::Duration::from_secs(3),
        stream.read(&mut buffer),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(read, 0);

    server.shutdown();
}

#[tokio::test]
async fn connection_cap_closes_excess_sockets_silently() {
    let server = Node::start_with("server", "t0k3n", |config| {
        config.max_connections = 2;
    })
    .await;

    let _c1 = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let _c2 = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut c3 = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let mut buffer = [0u8; 16];
    let read = tokio::time::timeout(
        std::time::Duration::from_secs(3),
        c3.read(&mut buffer),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(read, 0, "overflow connection must see EOF without any bytes");

    server.shutdown();
}

#[tokio::test]
async fn wrong_token_cannot_sync() {
    let server = Node::start("server", "right-token").await;
    let intruder = Node::start_with("intruder", "wrong-token", |_| {}).await;

    server.db.put("secrets", "s1", json!({"classified": true})).unwrap();

    let result = intruder.session_to(&server).run_once().await;
    assert!(result.is_err());
    assert!(intruder.db.get("secrets", "s1").unwrap().is_none());

    server.shutdown();
    intruder.shutdown();
}

#[tokio::test]
async fn batch_limit_boundary_roundtrips() {
    let server = Node::start_with("server", "t", |config| {
        config.batch_entry_limit = 5;
    })
    .await;
    let client = Node::start_with("client", "t", |config| {
        config.batch_entry_limit = 5;
    })
    .await;

    // Exactly the limit, then one over
    let items: Vec<(String, serde_json::Value)> =
        (0..5).map(|i| (format!("k{i}"), json!({"i": i}))).collect();
    server.db.put_many("users", items).unwrap();
    let stats = client.session_to(&server).run_once().await.unwrap();
    assert_eq!(stats.pulled, 5);

    server.db.put("users", "k5", json!({"i": 5})).unwrap();
    let stats = client.session_to(&server).run_once().await.unwrap();
    assert_eq!(stats.pulled, 1);
    assert_eq!(client.db.count("users", None).unwrap(), 6);

    server.shutdown();
    client.shutdown();
}
