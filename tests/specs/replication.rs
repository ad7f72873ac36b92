// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Convergence scenarios between full nodes.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::common::Node;
use entgl_core::{Hlc, Store};
use serde_json::json;

#[tokio::test]
async fn lww_convergence_between_two_writers() {
    let a = Node::start("a", "t0k3n").await;
    let b = Node::start("b", "t0k3n").await;

    a.db.put("users", "u1", json!({"name": "Alice", "age": 30})).unwrap();
    // Ensure b's write is strictly later in wall-clock terms
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    b.db.put("users", "u1", json!({"name": "Alice", "age": 31})).unwrap();

    a.session_to(&b).run_once().await.unwrap();

    let expected = json!({"name": "Alice", "age": 31});
    assert_eq!(a.db.get("users", "u1").unwrap().unwrap().content, Some(expected.clone()));
    assert_eq!(b.db.get("users", "u1").unwrap().unwrap().content, Some(expected));

    // Both vector clocks carry exactly one write per node and are equal
    let vc_a = a.db.vector_clock().unwrap();
    let vc_b = b.db.vector_clock().unwrap();
    assert_eq!(vc_a, vc_b);
    assert!(vc_a.get("a").is_some());
    assert!(vc_a.get("b").is_some());

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn concurrent_writes_converge_to_max_timestamp() {
    let a = Node::start("a", "t0k3n").await;
    let b = Node::start("b", "t0k3n").await;

    // Writes land on both sides before any sync
    a.db.put("docs", "d", json!({"winner": "a?"})).unwrap();
    b.db.put("docs", "d", json!({"winner": "b?"})).unwrap();

    a.session_to(&b).run_once().await.unwrap();

    let doc_a = a.db.get("docs", "d").unwrap().unwrap();
    let doc_b = b.db.get("docs", "d").unwrap().unwrap();
    assert_eq!(doc_a.content, doc_b.content);
    assert_eq!(doc_a.updated_at, doc_b.updated_at);

    // The winner is the maximum timestamp under the HLC total order
    let ts_a = a.db.store().oplog_for_node_after("a", &Hlc::zero(), None).unwrap()[0]
        .timestamp
        .clone();
    let ts_b = b.db.store().oplog_for_node_after("b", &Hlc::zero(), None).unwrap()[0]
        .timestamp
        .clone();
    assert_eq!(doc_a.updated_at, ts_a.max(ts_b));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn tombstone_propagates_with_chain_intact() {
    let a = Node::start("a", "t0k3n").await;
    let b = Node::start("b", "t0k3n").await;

    a.db.put("t", "k1", json!({"x": 1})).unwrap();
    a.db.delete("t", "k1").unwrap();

    a.session_to(&b).run_once().await.unwrap();

    assert!(b.db.get("t", "k1").unwrap().is_none());

    let entries = b.db.store().oplog_for_node_after("a", &Hlc::zero(), None).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].previous_hash, entries[0].hash);
    assert!(entries.iter().all(|e| e.is_valid()));

    // The tombstone itself is retained for LWW
    let raw = b.db.store().get_document("t", "k1").unwrap().unwrap();
    assert!(raw.is_deleted);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn entries_replicate_transitively_through_a_middle_node() {
    let a = Node::start("a", "t0k3n").await;
    let b = Node::start("b", "t0k3n").await;
    let c = Node::start("c", "t0k3n").await;

    a.db.put("users", "u1", json!({"v": 1})).unwrap();
    a.db.put("users", "u2", json!({"v": 2})).unwrap();
    a.db.put("users", "u3", json!({"v": 3})).unwrap();

    // B learns from A, then C learns A's entries from B
    b.session_to(&a).run_once().await.unwrap();
    c.session_to(&b).run_once().await.unwrap();

    let entries = c.db.store().oplog_for_node_after("a", &Hlc::zero(), None).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[1].previous_hash, entries[0].hash);
    assert_eq!(entries[2].previous_hash, entries[1].hash);
    assert!(c.db.get("users", "u3").unwrap().is_some());

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn bidirectional_sync_reaches_identical_state() {
    let a = Node::start_sqlite("a", "t0k3n").await;
    let b = Node::start_sqlite("b", "t0k3n").await;

    for i in 0..20 {
        a.db.put("users", &format!("a{i}"), json!({"i": i, "src": "a"})).unwrap();
        b.db.put("users", &format!("b{i}"), json!({"i": i, "src": "b"})).unwrap();
    }
    a.db.delete("users", "a3").unwrap();
    b.db.delete("users", "b7").unwrap();

    a.session_to(&b).run_once().await.unwrap();

    assert_eq!(a.db.vector_clock().unwrap(), b.db.vector_clock().unwrap());
    assert_eq!(a.db.count("users", None).unwrap(), 38);
    assert_eq!(b.db.count("users", None).unwrap(), 38);

    // Spot-check both directions, including tombstones
    assert!(a.db.get("users", "b7").unwrap().is_none());
    assert!(b.db.get("users", "a3").unwrap().is_none());
    assert_eq!(
        a.db.get("users", "b0").unwrap().unwrap().content,
        b.db.get("users", "b0").unwrap().unwrap().content
    );

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn repeated_sessions_are_stable() {
    let a = Node::start("a", "t0k3n").await;
    let b = Node::start("b", "t0k3n").await;

    a.db.put("users", "u1", json!({"v": 1})).unwrap();
    a.session_to(&b).run_once().await.unwrap();

    // A quiescent pair converges in the first round and stays put
    let stats = a.session_to(&b).run_once().await.unwrap();
    assert_eq!(stats.pulled, 0);
    assert_eq!(stats.pushed, 0);
    assert_eq!(stats.rounds, 1);

    a.shutdown();
    b.shutdown();
}
