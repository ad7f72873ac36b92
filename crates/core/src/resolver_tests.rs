// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::hlc::Hlc;
use serde_json::json;

fn put(key: &str, value: serde_json::Value, ts: Hlc) -> OplogEntry {
    OplogEntry::new("c", key, OpKind::Put, Some(value), ts, "")
}

fn del(key: &str, ts: Hlc) -> OplogEntry {
    OplogEntry::new("c", key, OpKind::Delete, None, ts, "")
}

#[test]
fn put_on_missing_document_applies() {
    let incoming = put("k", json!({"v": 1}), Hlc::new(10, 0, "a"));
    let r = LwwResolver.resolve(None, &incoming);

    assert!(r.should_apply);
    let doc = r.merged.unwrap();
    assert_eq!(doc.content, Some(json!({"v": 1})));
    assert!(!doc.is_deleted);
    assert_eq!(doc.updated_at, incoming.timestamp);
}

#[test]
fn delete_on_missing_document_stores_tombstone() {
    let incoming = del("k", Hlc::new(10, 0, "a"));
    let r = LwwResolver.resolve(None, &incoming);

    assert!(r.should_apply);
    let doc = r.merged.unwrap();
    assert!(doc.is_deleted);
    assert_eq!(doc.updated_at, incoming.timestamp);
}

#[test]
fn stale_incoming_is_skipped() {
    let local = Document::new("c", "k", json!({"v": 2}), Hlc::new(20, 0, "a"));

    let older = put("k", json!({"v": 1}), Hlc::new(10, 0, "b"));
    assert!(!LwwResolver.resolve(Some(&local), &older).should_apply);

    // Equal timestamps also lose: the local write is already the winner
    let equal = put("k", json!({"v": 1}), Hlc::new(20, 0, "a"));
    assert!(!LwwResolver.resolve(Some(&local), &equal).should_apply);
}

#[test]
fn newer_put_replaces_and_revives() {
    let local = Document::tombstone("c", "k", None, Hlc::new(10, 0, "a"));
    let incoming = put("k", json!({"v": 3}), Hlc::new(20, 0, "b"));

    let r = LwwResolver.resolve(Some(&local), &incoming);
    assert!(r.should_apply);
    let doc = r.merged.unwrap();
    assert!(!doc.is_deleted);
    assert_eq!(doc.content, Some(json!({"v": 3})));
}

#[test]
fn newer_delete_keeps_prior_content_on_tombstone() {
    let local = Document::new("c", "k", json!({"v": 1}), Hlc::new(10, 0, "a"));
    let incoming = del("k", Hlc::new(20, 0, "b"));

    let r = LwwResolver.resolve(Some(&local), &incoming);
    assert!(r.should_apply);
    let doc = r.merged.unwrap();
    assert!(doc.is_deleted);
    assert_eq!(doc.content, Some(json!({"v": 1})));
}

#[test]
fn tie_breaks_by_node_id() {
    // Same physical and logical; node id decides the total order
    let local = Document::new("c", "k", json!({"v": "alpha"}), Hlc::new(10, 0, "alpha"));
    let incoming = put("k", json!({"v": "beta"}), Hlc::new(10, 0, "beta"));

    let r = LwwResolver.resolve(Some(&local), &incoming);
    assert!(r.should_apply);
    assert_eq!(r.merged.unwrap().content, Some(json!({"v": "beta"})));
}

#[test]
fn put_without_payload_is_rejected() {
    let incoming = OplogEntry::new("c", "k", OpKind::Put, None, Hlc::new(10, 0, "a"), "");
    let r = LwwResolver.resolve(None, &incoming);
    assert!(!r.should_apply);
    assert!(r.merged.is_none());
}

#[test]
fn fold_applies_in_order() {
    let entries = vec![
        put("k", json!({"v": 1}), Hlc::new(10, 0, "a")),
        put("k", json!({"v": 2}), Hlc::new(20, 0, "a")),
        del("k", Hlc::new(30, 0, "a")),
    ];
    let refs: Vec<&OplogEntry> = entries.iter().collect();

    let (state, accepted) = fold_entries(&LwwResolver, None, refs);
    assert_eq!(accepted.len(), 3);
    let doc = state.unwrap();
    assert!(doc.is_deleted);
    assert_eq!(doc.updated_at, Hlc::new(30, 0, "a"));
}

#[test]
fn fold_keeps_skipped_entries_but_drops_empty_puts() {
    let newer_local = Document::new("c", "k", json!({"v": 9}), Hlc::new(100, 0, "z"));
    let entries = vec![
        put("k", json!({"v": 1}), Hlc::new(10, 0, "a")),
        OplogEntry::new("c", "k", OpKind::Put, None, Hlc::new(20, 0, "a"), ""),
    ];
    let refs: Vec<&OplogEntry> = entries.iter().collect();

    let (state, accepted) = fold_entries(&LwwResolver, Some(newer_local.clone()), refs);
    // The stale put is persisted as history, the empty put is dropped
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].payload, Some(json!({"v": 1})));
    // Local state wins
    assert_eq!(state.unwrap(), newer_local);
}

#[test]
fn fold_is_idempotent() {
    let entries = vec![put("k", json!({"v": 1}), Hlc::new(10, 0, "a"))];
    let refs: Vec<&OplogEntry> = entries.iter().collect();

    let (first, _) = fold_entries(&LwwResolver, None, refs.clone());
    let (second, _) = fold_entries(&LwwResolver, first.clone(), refs);
    assert_eq!(first, second);
}
