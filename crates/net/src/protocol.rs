// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Sync protocol messages.
//!
//! Structured messages are JSON payloads inside frames; the frame header's
//! message type always matches the variant. Snapshot chunks are not
//! structured: they travel as raw [`MsgType::SnapshotChunk`] frames,
//! bounded at [`SNAPSHOT_CHUNK_BYTES`], with an empty chunk terminating
//! the stream.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use entgl_core::{Hlc, OplogEntry, VectorClock};

use crate::error::{NetError, Result};
use crate::frame::{read_frame, write_frame, MsgType};
use crate::handshake::CipherState;

/// Upper bound for one snapshot chunk.
pub const SNAPSHOT_CHUNK_BYTES: usize = 1024 * 1024;

/// Messages exchanged between peers after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// First encrypted message from the connecting side.
    Hello { node_id: String, auth_token: String },

    /// Server's acceptance of a Hello.
    HelloAck { node_id: String },

    /// Full vector clock advertisement.
    VectorClock { clock: VectorClock },

    /// Ask for entries of one origin node after a timestamp.
    BatchRequest {
        node_id: String,
        after: Hlc,
        collections: Option<Vec<String>>,
        limit: u32,
    },

    /// A slice of one origin node's chain. Also sent unsolicited to push.
    BatchResponse {
        node_id: String,
        entries: Vec<OplogEntry>,
        done: bool,
    },

    /// Ask for the chain segment between two hashes.
    ChainRangeRequest {
        node_id: String,
        start_hash: String,
        end_hash: String,
    },

    /// The requested segment, or a signal that it was pruned away.
    ChainRangeResponse {
        node_id: String,
        entries: Vec<OplogEntry>,
        snapshot_required: bool,
    },

    /// Ask the peer to stream its full snapshot.
    SnapshotRequest,

    /// Keepalive; echoed verbatim.
    Ping { id: u64 },

    /// Orderly teardown.
    Close { reason: String },
}

impl SyncMessage {
    /// The frame message type this variant travels under.
    pub fn msg_type(&self) -> MsgType {
        match self {
            // Hello and its ack ride on the handshake type: they complete
            // session establishment.
            SyncMessage::Hello { .. } | SyncMessage::HelloAck { .. } => MsgType::Handshake,
            SyncMessage::VectorClock { .. } => MsgType::VectorClock,
            SyncMessage::BatchRequest { .. } => MsgType::BatchRequest,
            SyncMessage::BatchResponse { .. } => MsgType::BatchResponse,
            SyncMessage::ChainRangeRequest { .. } => MsgType::ChainRangeRequest,
            SyncMessage::ChainRangeResponse { .. } => MsgType::ChainRangeResponse,
            SyncMessage::SnapshotRequest => MsgType::SnapshotRequest,
            SyncMessage::Ping { .. } => MsgType::Ping,
            SyncMessage::Close { .. } => MsgType::Close,
        }
    }
}

/// Serializes and sends one structured message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cipher: &mut CipherState,
    message: &SyncMessage,
    max_frame: usize,
) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, Some(cipher), message.msg_type(), &payload, max_frame).await
}

/// What a read produced: a structured message or a raw snapshot chunk.
#[derive(Debug)]
pub enum Inbound {
    Message(SyncMessage),
    SnapshotChunk(Vec<u8>),
}

/// Reads one frame and decodes it.
pub async fn read_inbound<R: AsyncRead + Unpin>(
    reader: &mut R,
    cipher: &mut CipherState,
    max_frame: usize,
) -> Result<Inbound> {
    let (msg_type, payload) = read_frame(reader, Some(cipher), max_frame).await?;
    if msg_type == MsgType::SnapshotChunk {
        if payload.len() > SNAPSHOT_CHUNK_BYTES {
            return Err(NetError::FrameTooLarge {
                size: payload.len(),
                max: SNAPSHOT_CHUNK_BYTES,
            });
        }
        return Ok(Inbound::SnapshotChunk(payload));
    }

    let message: SyncMessage = serde_json::from_slice(&payload)?;
    if message.msg_type() != msg_type {
        return Err(NetError::Protocol(format!(
            "frame type {msg_type:?} does not match message body"
        )));
    }
    Ok(Inbound::Message(message))
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
