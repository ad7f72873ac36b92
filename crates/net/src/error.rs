// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for entgl-net operations.

use thiserror::Error;

/// All possible errors in the sync and wire layers.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("frame decryption failed")]
    Decrypt,

    #[error("nonce space exhausted, session must be closed")]
    NonceExhausted,

    #[error("authentication failed")]
    AuthFailed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("peer closed the connection: {0}")]
    PeerClosed(String),

    #[error(transparent)]
    Core(#[from] entgl_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for entgl-net operations.
pub type Result<T> = std::result::Result<T, NetError>;
