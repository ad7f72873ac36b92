// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::frame::DEFAULT_MAX_FRAME_BYTES;
use entgl_core::OpKind;
use serde_json::json;

fn cipher_pair() -> (CipherState, CipherState) {
    let key_a = [1u8; 32];
    let key_b = [2u8; 32];
    (CipherState::new(&key_a, &key_b), CipherState::new(&key_b, &key_a))
}

fn sample_entry() -> OplogEntry {
    OplogEntry::new(
        "users",
        "u1",
        OpKind::Put,
        Some(json!({"name": "Alice"})),
        Hlc::new(100, 0, "a"),
        "",
    )
}

async fn roundtrip(message: SyncMessage) -> SyncMessage {
    let (mut client, mut server) = cipher_pair();
    let mut wire = Vec::new();
    write_message(&mut wire, &mut client, &message, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap();
    match read_inbound(&mut &wire[..], &mut server, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap()
    {
        Inbound::Message(decoded) => decoded,
        Inbound::SnapshotChunk(_) => unreachable!("structured message expected"),
    }
}

#[tokio::test]
async fn hello_roundtrip() {
    let message = SyncMessage::Hello { node_id: "a".into(), auth_token: "t0k3n".into() };
    assert_eq!(roundtrip(message.clone()).await, message);
    assert_eq!(message.msg_type(), MsgType::Handshake);
}

#[tokio::test]
async fn vector_clock_roundtrip() {
    let mut clock = VectorClock::new();
    clock.observe(&Hlc::new(100, 2, "a"));
    clock.observe(&Hlc::new(50, 0, "b"));
    let message = SyncMessage::VectorClock { clock };
    assert_eq!(roundtrip(message.clone()).await, message);
}

#[tokio::test]
async fn batch_messages_roundtrip() {
    let request = SyncMessage::BatchRequest {
        node_id: "a".into(),
        after: Hlc::new(10, 0, "a"),
        collections: Some(vec!["users".into()]),
        limit: 500,
    };
    assert_eq!(roundtrip(request.clone()).await, request);
    assert_eq!(request.msg_type(), MsgType::BatchRequest);

    let response = SyncMessage::BatchResponse {
        node_id: "a".into(),
        entries: vec![sample_entry()],
        done: true,
    };
    let decoded = roundtrip(response.clone()).await;
    assert_eq!(decoded, response);
    if let SyncMessage::BatchResponse { entries, .. } = decoded {
        assert!(entries[0].is_valid());
    }
}

#[tokio::test]
async fn chain_range_messages_roundtrip() {
    let request = SyncMessage::ChainRangeRequest {
        node_id: "a".into(),
        start_hash: "aa".into(),
        end_hash: "bb".into(),
    };
    assert_eq!(roundtrip(request.clone()).await, request);

    let response = SyncMessage::ChainRangeResponse {
        node_id: "a".into(),
        entries: vec![],
        snapshot_required: true,
    };
    assert_eq!(roundtrip(response.clone()).await, response);
}

#[tokio::test]
async fn snapshot_chunks_pass_through_raw() {
    let (mut client, mut server) = cipher_pair();
    let chunk = vec![0xAB; 1000];

    let mut wire = Vec::new();
    crate::frame::write_frame(
        &mut wire,
        Some(&mut client),
        MsgType::SnapshotChunk,
        &chunk,
        DEFAULT_MAX_FRAME_BYTES,
    )
    .await
    .unwrap();

    match read_inbound(&mut &wire[..], &mut server, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap()
    {
        Inbound::SnapshotChunk(data) => assert_eq!(data, chunk),
        Inbound::Message(_) => unreachable!("chunk expected"),
    }
}

#[tokio::test]
async fn mismatched_frame_type_is_rejected() {
    let (mut client, mut server) = cipher_pair();
    let body = serde_json::to_vec(&SyncMessage::Ping { id: 1 }).unwrap();

    let mut wire = Vec::new();
    crate::frame::write_frame(
        &mut wire,
        Some(&mut client),
        MsgType::Close,
        &body,
        DEFAULT_MAX_FRAME_BYTES,
    )
    .await
    .unwrap();

    let err = read_inbound(&mut &wire[..], &mut server, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Protocol(_)));
}
