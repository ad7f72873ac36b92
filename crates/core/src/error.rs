// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for entgl-core operations.

use thiserror::Error;

/// All possible errors that can occur in entgl-core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("corrupt store: {0}")]
    CorruptStore(String),

    #[error("oplog entry failed hash validation: {0}")]
    HashMismatch(String),

    #[error("chain gap for node '{node_id}': expected previous hash '{expected}', got '{actual}'")]
    ChainGap {
        node_id: String,
        expected: String,
        actual: String,
    },

    #[error("incremental sync cannot close the gap for node '{0}'; full snapshot required")]
    SnapshotRequired(String),

    #[error("put without payload for {collection}/{key}")]
    MissingPayload { collection: String, key: String },

    #[error("collection '{0}' is not replicated by this node")]
    UnsupportedCollection(String),

    #[error("invalid HLC: {0}")]
    InvalidHlc(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported snapshot version {0}")]
    UnsupportedSnapshotVersion(u32),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for entgl-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
