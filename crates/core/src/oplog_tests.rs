// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use serde_json::json;

fn entry(key: &str, ts: Hlc, prev: &str) -> OplogEntry {
    OplogEntry::new("users", key, OpKind::Put, Some(json!({"k": key})), ts, prev)
}

#[test]
fn hash_is_self_consistent() {
    let e = entry("u1", Hlc::new(100, 0, "a"), "");
    assert!(!e.hash.is_empty());
    assert!(e.is_valid());
    // Lowercase hex, 32 bytes
    assert_eq!(e.hash.len(), 64);
    assert!(e.hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn tampered_entry_fails_validation() {
    let mut e = entry("u1", Hlc::new(100, 0, "a"), "");
    e.payload = Some(json!({"k": "evil"}));
    assert!(!e.is_valid());

    let mut e = entry("u1", Hlc::new(100, 0, "a"), "");
    e.previous_hash = "0".repeat(64);
    assert!(!e.is_valid());

    let mut e = entry("u1", Hlc::new(100, 0, "a"), "");
    e.timestamp = Hlc::new(101, 0, "a");
    assert!(!e.is_valid());
}

#[test]
fn hash_covers_every_field() {
    let base = entry("u1", Hlc::new(100, 0, "a"), "");
    let other_key = entry("u2", Hlc::new(100, 0, "a"), "");
    let other_prev = entry("u1", Hlc::new(100, 0, "a"), "deadbeef");
    let other_kind =
        OplogEntry::new("users", "u1", OpKind::Delete, None, Hlc::new(100, 0, "a"), "");

    assert_ne!(base.hash, other_key.hash);
    assert_ne!(base.hash, other_prev.hash);
    assert_ne!(base.hash, other_kind.hash);
}

#[test]
fn delete_entry_has_no_payload() {
    let e = OplogEntry::new("t", "k1", OpKind::Delete, None, Hlc::new(5, 0, "a"), "");
    assert!(e.payload.is_none());
    assert!(e.is_valid());
}

#[test]
fn chain_links_via_previous_hash() {
    let e1 = entry("u1", Hlc::new(100, 0, "a"), "");
    let e2 = entry("u1", Hlc::new(101, 0, "a"), &e1.hash);
    let e3 = entry("u1", Hlc::new(102, 0, "a"), &e2.hash);

    assert_eq!(e2.previous_hash, e1.hash);
    assert_eq!(e3.previous_hash, e2.hash);
    assert!(e1.is_valid() && e2.is_valid() && e3.is_valid());
}

#[test]
fn node_id_comes_from_timestamp() {
    let e = entry("u1", Hlc::new(100, 0, "node-7"), "");
    assert_eq!(e.node_id(), "node-7");
}

#[test]
fn serde_roundtrip_preserves_hash() {
    let e = entry("u1", Hlc::new(100, 3, "a"), "");
    let json = serde_json::to_string(&e).unwrap();
    let back: OplogEntry = serde_json::from_str(&json).unwrap();
    assert_eq!(e, back);
    assert!(back.is_valid());
}

#[test]
fn snapshot_metadata_of_entry() {
    let e = entry("u1", Hlc::new(100, 2, "a"), "");
    let meta = SnapshotMetadata::of_entry(&e);
    assert_eq!(meta.node_id, "a");
    assert_eq!(meta.hash, e.hash);
    assert_eq!(meta.timestamp(), e.timestamp);
}

#[test]
fn sort_by_timestamp_orders_ascending() {
    let mut entries = vec![
        entry("u1", Hlc::new(300, 0, "a"), ""),
        entry("u2", Hlc::new(100, 0, "a"), ""),
        entry("u3", Hlc::new(200, 0, "a"), ""),
    ];
    sort_by_timestamp(&mut entries);
    assert_eq!(entries[0].key, "u2");
    assert_eq!(entries[1].key, "u3");
    assert_eq!(entries[2].key, "u1");
}

#[test]
fn op_kind_display() {
    assert_eq!(OpKind::Put.to_string(), "put");
    assert_eq!(OpKind::Delete.to_string(), "delete");
}
