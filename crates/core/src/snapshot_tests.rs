// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::config::PeerType;
use crate::memory::MemoryStore;
use crate::oplog::OpKind;
use serde_json::json;

fn seeded_store() -> (MemoryStore, Vec<OplogEntry>) {
    let store = MemoryStore::new();
    let e1 = OplogEntry::new("users", "u1", OpKind::Put, Some(json!({"v": 1})), Hlc::new(10, 0, "a"), "");
    let e2 = OplogEntry::new("users", "u1", OpKind::Put, Some(json!({"v": 2})), Hlc::new(20, 0, "a"), &e1.hash);
    let e3 = OplogEntry::new("t", "k1", OpKind::Delete, None, Hlc::new(30, 0, "b"), "");
    store.apply_batch(&[], &[e1.clone(), e2.clone(), e3.clone()]).unwrap();
    store
        .save_remote_peer(&RemotePeerConfiguration::new("p1", "10.0.0.1:9", PeerType::StaticRemote))
        .unwrap();
    (store, vec![e1, e2, e3])
}

#[test]
fn export_captures_everything() {
    let (store, entries) = seeded_store();
    let snapshot = export(&store, "a").unwrap();

    assert_eq!(snapshot.version, SNAPSHOT_VERSION);
    assert_eq!(snapshot.node_id, "a");
    assert_eq!(snapshot.documents.len(), 2); // u1 + tombstone k1
    assert_eq!(snapshot.oplog.len(), entries.len());
    assert_eq!(snapshot.remote_peers.len(), 1);
}

#[test]
fn stream_roundtrip() {
    let (store, _) = seeded_store();
    let snapshot = export(&store, "a").unwrap();

    let mut buffer = Vec::new();
    write_to(&snapshot, &mut buffer).unwrap();
    let back = read_from(&buffer[..]).unwrap();

    assert_eq!(back.documents, snapshot.documents);
    assert_eq!(back.oplog, snapshot.oplog);
    assert_eq!(back.remote_peers, snapshot.remote_peers);
}

#[test]
fn unknown_version_is_rejected() {
    let (store, _) = seeded_store();
    let mut snapshot = export(&store, "a").unwrap();
    snapshot.version = 99;

    let mut buffer = Vec::new();
    write_to(&snapshot, &mut buffer).unwrap();
    assert!(matches!(
        read_from(&buffer[..]),
        Err(Error::UnsupportedSnapshotVersion(99))
    ));
}

#[test]
fn merge_into_empty_reproduces_state() {
    let (store, _) = seeded_store();
    let snapshot = export(&store, "a").unwrap();

    let target = MemoryStore::new();
    let stats = merge(&target, &snapshot).unwrap();

    assert_eq!(stats.entries_added, 3);
    assert_eq!(
        target.get_document("users", "u1").unwrap().unwrap().content,
        Some(json!({"v": 2}))
    );
    assert!(target.get_document("t", "k1").unwrap().unwrap().is_deleted);
    assert_eq!(target.vector_clock().unwrap(), store.vector_clock().unwrap());

    // Oplog after merge is exactly the source's oplog
    assert_eq!(
        target.oplog_after(&Hlc::zero(), None).unwrap().len(),
        store.oplog_after(&Hlc::zero(), None).unwrap().len()
    );
}

#[test]
fn merge_preserves_newer_local_documents() {
    let (store, _) = seeded_store();
    let snapshot = export(&store, "a").unwrap();

    let target = MemoryStore::new();
    // Target has a newer local write for u1
    let newer = OplogEntry::new(
        "users",
        "u1",
        OpKind::Put,
        Some(json!({"v": "local"})),
        Hlc::new(100, 0, "c"),
        "",
    );
    target.apply_batch(&[], &[newer]).unwrap();

    merge(&target, &snapshot).unwrap();

    assert_eq!(
        target.get_document("users", "u1").unwrap().unwrap().content,
        Some(json!({"v": "local"}))
    );
    // But the snapshot's history is still present
    assert_eq!(target.oplog_for_node_after("a", &Hlc::zero(), None).unwrap().len(), 2);
}

#[test]
fn merge_is_idempotent() {
    let (store, _) = seeded_store();
    let snapshot = export(&store, "a").unwrap();

    let target = MemoryStore::new();
    merge(&target, &snapshot).unwrap();
    let stats = merge(&target, &snapshot).unwrap();

    assert_eq!(stats.entries_added, 0);
    assert_eq!(stats.peers_added, 0);
}

#[test]
fn merge_skips_existing_peers() {
    let (store, _) = seeded_store();
    let snapshot = export(&store, "a").unwrap();

    let target = MemoryStore::new();
    let mut local_peer = RemotePeerConfiguration::new("p1", "other:1", PeerType::CloudRemote);
    local_peer.enabled = false;
    target.save_remote_peer(&local_peer).unwrap();

    merge(&target, &snapshot).unwrap();

    // Local peer config wins
    assert_eq!(target.remote_peer("p1").unwrap().unwrap().address, "other:1");
}

#[test]
fn replace_discards_local_state() {
    let (store, _) = seeded_store();
    let snapshot = export(&store, "a").unwrap();

    let target = MemoryStore::new();
    let local = OplogEntry::new("x", "y", OpKind::Put, Some(json!(1)), Hlc::new(5, 0, "z"), "");
    target.apply_batch(&[], &[local]).unwrap();

    replace(&target, &snapshot).unwrap();

    assert!(target.get_document("x", "y").unwrap().is_none());
    assert!(target.oplog_for_node_after("z", &Hlc::zero(), None).unwrap().is_empty());
    assert_eq!(
        target.get_document("users", "u1").unwrap().unwrap().content,
        Some(json!({"v": 2}))
    );
}

#[test]
fn merge_takes_newer_snapshot_boundaries() {
    let source = MemoryStore::new();
    source
        .update_snapshot_metadata(&SnapshotMetadata {
            node_id: "a".into(),
            physical_ms: 100,
            logical: 0,
            hash: "newer".into(),
        })
        .unwrap();
    let snapshot = export(&source, "a").unwrap();

    let target = MemoryStore::new();
    target
        .update_snapshot_metadata(&SnapshotMetadata {
            node_id: "a".into(),
            physical_ms: 50,
            logical: 0,
            hash: "older".into(),
        })
        .unwrap();

    merge(&target, &snapshot).unwrap();
    assert_eq!(target.snapshot_metadata("a").unwrap().unwrap().hash, "newer");
}

#[test]
fn retention_cutoff_subtracts_window() {
    let cutoff = retention_cutoff(10_000_000, 1);
    assert_eq!(cutoff.physical_ms, 10_000_000 - 3_600_000);

    // Saturates instead of underflowing
    let cutoff = retention_cutoff(10, 1);
    assert_eq!(cutoff.physical_ms, 0);
}
