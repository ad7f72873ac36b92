// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Hash-chained operation log entries.
//!
//! Every mutation produces an immutable [`OplogEntry`]. Entries emitted by
//! one node form a linear chain: each entry's `previous_hash` equals the
//! `hash` of that node's preceding entry, and the first entry links to the
//! empty string. There is no cross-node chain.
//!
//! When a chain prefix is pruned, [`SnapshotMetadata`] keeps the coordinates
//! of the last truncated entry so later entries can still attach.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::hlc::Hlc;

/// Kind of mutation recorded in the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Put,
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Put => "put",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable record of a document mutation.
///
/// The hash covers every field, so entries are tamper-evident and
/// [`OplogEntry::is_valid`] can re-derive it at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub collection: String,
    pub key: String,
    pub kind: OpKind,
    /// Document content for `Put`; absent for `Delete`.
    pub payload: Option<Value>,
    pub timestamp: Hlc,
    /// Hash of the preceding entry from the same node, or "" for genesis.
    pub previous_hash: String,
    pub hash: String,
}

impl OplogEntry {
    /// Builds an entry and computes its hash.
    pub fn new(
        collection: impl Into<String>,
        key: impl Into<String>,
        kind: OpKind,
        payload: Option<Value>,
        timestamp: Hlc,
        previous_hash: impl Into<String>,
    ) -> Self {
        let mut entry = OplogEntry {
            collection: collection.into(),
            key: key.into(),
            kind,
            payload,
            timestamp,
            previous_hash: previous_hash.into(),
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }

    /// The node that emitted this entry.
    pub fn node_id(&self) -> &str {
        &self.timestamp.node_id
    }

    /// Re-derives the hash from the entry's fields.
    pub fn compute_hash(&self) -> String {
        let payload_text = self.payload.as_ref().map(Value::to_string).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(self.collection.as_bytes());
        hasher.update(b"|");
        hasher.update(self.key.as_bytes());
        hasher.update(b"|");
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(payload_text.as_bytes());
        hasher.update(b"|");
        hasher.update(self.timestamp.canonical().as_bytes());
        hasher.update(b"|");
        hasher.update(self.previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Checks that the stored hash matches the entry's contents.
    pub fn is_valid(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

/// Coordinates of the last entry pruned from a node's chain.
///
/// Acts as a virtual entry zero: an incoming entry whose `previous_hash`
/// equals `hash` attaches at the truncation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub node_id: String,
    pub physical_ms: i64,
    pub logical: i32,
    pub hash: String,
}

impl SnapshotMetadata {
    /// Builds boundary metadata from a pruned entry.
    pub fn of_entry(entry: &OplogEntry) -> Self {
        SnapshotMetadata {
            node_id: entry.node_id().to_string(),
            physical_ms: entry.timestamp.physical_ms,
            logical: entry.timestamp.logical,
            hash: entry.hash.clone(),
        }
    }

    /// The boundary as an HLC timestamp.
    pub fn timestamp(&self) -> Hlc {
        Hlc::new(self.physical_ms, self.logical, self.node_id.clone())
    }
}

/// Sorts entries by timestamp, the order chains are validated and applied in.
pub fn sort_by_timestamp(entries: &mut [OplogEntry]) {
    entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
}

#[cfg(test)]
#[path = "oplog_tests.rs"]
mod tests;
