// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-level gap recovery and snapshot fallback.

#![allow(clippy::unwrap_used)]

use super::*;
use crate::server::tests::TestNode;
use entgl_core::{Hlc, SnapshotMetadata, Store};
use serde_json::json;

#[tokio::test]
async fn pull_attaches_at_snapshot_boundary() {
    let server = TestNode::start("server", "t0k3n").await;
    let client = TestNode::start("client", "t0k3n").await;

    server.db.put("users", "u1", json!({"v": 1})).unwrap();
    server.db.put("users", "u2", json!({"v": 2})).unwrap();
    server.db.put("users", "u3", json!({"v": 3})).unwrap();

    let entries = server
        .db
        .store()
        .oplog_for_node_after("server", &Hlc::zero(), None)
        .unwrap();

    // The server prunes everything before its last entry
    let removed = server.db.store().prune_oplog(&entries[2].timestamp).unwrap();
    assert_eq!(removed, 2);

    // The client already knows the truncation boundary (say, from an old
    // snapshot) but none of the retained entries.
    client
        .db
        .store()
        .update_snapshot_metadata(&SnapshotMetadata::of_entry(&entries[1]))
        .unwrap();

    let stats = client.session_to(&server).run_once().await.unwrap();
    assert!(!stats.snapshot_fallback);
    assert_eq!(stats.pulled, 1);
    assert!(client.db.get("users", "u3").unwrap().is_some());

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn fresh_node_falls_back_to_snapshot_after_prune() {
    let server = TestNode::start("server", "t0k3n").await;
    let client = TestNode::start("client", "t0k3n").await;

    server.db.put("users", "u1", json!({"v": 1})).unwrap();
    server.db.put("users", "u2", json!({"v": 2})).unwrap();
    server.db.put("users", "u3", json!({"v": 3})).unwrap();

    let entries = server
        .db
        .store()
        .oplog_for_node_after("server", &Hlc::zero(), None)
        .unwrap();
    server.db.store().prune_oplog(&entries[2].timestamp).unwrap();

    // The fresh client cannot close the gap incrementally: the chain
    // range below the boundary is gone, so it must pull a snapshot.
    let stats = client.session_to(&server).run_once().await.unwrap();
    assert!(stats.snapshot_fallback);

    for key in ["u1", "u2", "u3"] {
        assert!(client.db.get("users", key).unwrap().is_some(), "missing {key}");
    }
    assert_eq!(client.db.vector_clock().unwrap(), server.db.vector_clock().unwrap());

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn snapshot_fallback_preserves_local_divergence() {
    let server = TestNode::start("server", "t0k3n").await;
    let client = TestNode::start("client", "t0k3n").await;

    server.db.put("users", "u1", json!({"v": 1})).unwrap();
    server.db.put("users", "u2", json!({"v": 2})).unwrap();

    let entries = server
        .db
        .store()
        .oplog_for_node_after("server", &Hlc::zero(), None)
        .unwrap();
    server.db.store().prune_oplog(&entries[1].timestamp).unwrap();

    // Local-only data on the client must survive the fallback merge
    client.db.put("local", "mine", json!({"kept": true})).unwrap();

    let stats = client.session_to(&server).run_once().await.unwrap();
    assert!(stats.snapshot_fallback);

    assert!(client.db.get("local", "mine").unwrap().is_some());
    assert!(client.db.get("users", "u1").unwrap().is_some());
    assert!(client.db.get("users", "u2").unwrap().is_some());

    server.shutdown();
    client.shutdown();
}

#[tokio::test]
async fn second_session_after_fallback_is_incremental() {
    let server = TestNode::start("server", "t0k3n").await;
    let client = TestNode::start("client", "t0k3n").await;

    server.db.put("users", "u1", json!({"v": 1})).unwrap();
    server.db.put("users", "u2", json!({"v": 2})).unwrap();
    let entries = server
        .db
        .store()
        .oplog_for_node_after("server", &Hlc::zero(), None)
        .unwrap();
    server.db.store().prune_oplog(&entries[1].timestamp).unwrap();

    let stats = client.session_to(&server).run_once().await.unwrap();
    assert!(stats.snapshot_fallback);

    // New data after the fallback flows incrementally
    server.db.put("users", "u3", json!({"v": 3})).unwrap();
    let stats = client.session_to(&server).run_once().await.unwrap();
    assert!(!stats.snapshot_fallback);
    assert_eq!(stats.pulled, 1);
    assert!(client.db.get("users", "u3").unwrap().is_some());

    server.shutdown();
    client.shutdown();
}
