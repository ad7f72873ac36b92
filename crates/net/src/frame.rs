// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed wire framing.
//!
//! Frame layout, all big-endian:
//!
//! | field    | bytes    | semantics                               |
//! |----------|----------|-----------------------------------------|
//! | length   | 4        | bytes that follow (msg_type + flags + payload) |
//! | msg_type | 1        | [`MsgType`]                             |
//! | flags    | 1        | bit0 compressed, bit1 encrypted         |
//! | payload  | length-2 | message bytes                           |
//!
//! Payloads at or above [`COMPRESS_THRESHOLD`] are zlib-compressed before
//! encryption (compress-then-encrypt). Encrypted payloads are
//! `nonce(12) || ciphertext || tag(16)` with `msg_type || flags` as the
//! authenticated associated data. The length is checked against the frame
//! cap before any allocation, and reads tolerate arbitrary TCP
//! fragmentation.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NetError, Result};
use crate::handshake::CipherState;

/// bit0: payload is zlib-compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
/// bit1: payload is AEAD-encrypted.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0010;

/// Payloads this large get compressed.
pub const COMPRESS_THRESHOLD: usize = 1024;

/// Default cap on a single frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Handshake = 0,
    VectorClock = 1,
    BatchRequest = 2,
    BatchResponse = 3,
    ChainRangeRequest = 4,
    ChainRangeResponse = 5,
    SnapshotRequest = 6,
    SnapshotChunk = 7,
    Ping = 8,
    Close = 9,
    /// Reserved for relaying opaque frames between peers.
    SecureEnvelope = 10,
}

impl TryFrom<u8> for MsgType {
    type Error = NetError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => MsgType::Handshake,
            1 => MsgType::VectorClock,
            2 => MsgType::BatchRequest,
            3 => MsgType::BatchResponse,
            4 => MsgType::ChainRangeRequest,
            5 => MsgType::ChainRangeResponse,
            6 => MsgType::SnapshotRequest,
            7 => MsgType::SnapshotChunk,
            8 => MsgType::Ping,
            9 => MsgType::Close,
            10 => MsgType::SecureEnvelope,
            other => return Err(NetError::UnknownMessageType(other)),
        })
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8], max_bytes: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data).take(max_bytes as u64 + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    if out.len() > max_bytes {
        return Err(NetError::FrameTooLarge { size: out.len(), max: max_bytes });
    }
    Ok(out)
}

/// Writes one frame, compressing and encrypting as configured.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cipher: Option<&mut CipherState>,
    msg_type: MsgType,
    payload: &[u8],
    max_frame: usize,
) -> Result<()> {
    let mut flags = 0u8;
    let mut data;

    if payload.len() >= COMPRESS_THRESHOLD {
        data = deflate(payload)?;
        flags |= FLAG_COMPRESSED;
    } else {
        data = payload.to_vec();
    }

    if let Some(cipher) = cipher {
        flags |= FLAG_ENCRYPTED;
        data = cipher.seal(&[msg_type as u8, flags], &data)?;
    }

    let length = data.len() + 2;
    if length > max_frame {
        return Err(NetError::FrameTooLarge { size: length, max: max_frame });
    }

    let mut header = [0u8; 6];
    header[..4].copy_from_slice(&(length as u32).to_be_bytes());
    header[4] = msg_type as u8;
    header[5] = flags;
    writer.write_all(&header).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame, decrypting and decompressing as flagged.
///
/// Consumes exactly the advertised number of bytes regardless of how the
/// transport fragments them.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    cipher: Option<&mut CipherState>,
    max_frame: usize,
) -> Result<(MsgType, Vec<u8>)> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).await?;
    let length = u32::from_be_bytes(length_bytes) as usize;

    if length < 2 {
        return Err(NetError::Protocol(format!("frame length {length} too short")));
    }
    if length > max_frame {
        return Err(NetError::FrameTooLarge { size: length, max: max_frame });
    }

    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    let msg_type = MsgType::try_from(head[0])?;
    let flags = head[1];

    let mut data = vec![0u8; length - 2];
    reader.read_exact(&mut data).await?;

    if flags & FLAG_ENCRYPTED != 0 {
        let cipher = cipher.ok_or_else(|| {
            NetError::Protocol("encrypted frame before handshake completed".into())
        })?;
        data = cipher.open(&[head[0], flags], &data)?;
    }

    if flags & FLAG_COMPRESSED != 0 {
        data = inflate(&data, max_frame)?;
    }

    Ok((msg_type, data))
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
