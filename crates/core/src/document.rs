// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Documents and their sync bookkeeping.
//!
//! A [`Document`] is an opaque JSON value addressed by `(collection, key)`.
//! Deletes keep a tombstone so last-write-wins can distinguish "deleted"
//! from "never existed". [`DocumentMetadata`] carries the sync-relevant
//! subset separately, for storage backends that cannot embed it in the
//! application record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::hlc::Hlc;

/// A JSON document in a named collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub key: String,
    /// The JSON payload. May be absent on tombstones.
    pub content: Option<Value>,
    /// Timestamp of the write that produced this state.
    pub updated_at: Hlc,
    /// True when the document has been deleted.
    #[serde(default)]
    pub is_deleted: bool,
}

impl Document {
    /// Creates a live document.
    pub fn new(
        collection: impl Into<String>,
        key: impl Into<String>,
        content: Value,
        updated_at: Hlc,
    ) -> Self {
        Document {
            collection: collection.into(),
            key: key.into(),
            content: Some(content),
            updated_at,
            is_deleted: false,
        }
    }

    /// Creates a tombstone for a deleted document.
    ///
    /// The prior content may be retained; only `is_deleted` decides
    /// visibility.
    pub fn tombstone(
        collection: impl Into<String>,
        key: impl Into<String>,
        content: Option<Value>,
        updated_at: Hlc,
    ) -> Self {
        Document {
            collection: collection.into(),
            key: key.into(),
            content,
            updated_at,
            is_deleted: true,
        }
    }

    /// Deterministic hash of the document content, as lowercase hex.
    ///
    /// Used to detect no-op writes; must be stable across nodes, so it is
    /// derived from the serialized JSON (object keys are ordered).
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        match &self.content {
            Some(value) => hasher.update(value.to_string().as_bytes()),
            None => hasher.update(b""),
        }
        hex::encode(hasher.finalize())
    }
}

/// Sync bookkeeping for one `(collection, key)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub collection: String,
    pub key: String,
    pub updated_at: Hlc,
    pub is_deleted: bool,
}

impl DocumentMetadata {
    /// Extracts the metadata of a document.
    pub fn of(doc: &Document) -> Self {
        DocumentMetadata {
            collection: doc.collection.clone(),
            key: doc.key.clone(),
            updated_at: doc.updated_at.clone(),
            is_deleted: doc.is_deleted,
        }
    }
}

#[cfg(test)]
#[path = "document_tests.rs"]
mod tests;
