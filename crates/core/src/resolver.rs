// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Conflict resolution for merging oplog entries into documents.
//!
//! The default policy is last-write-wins on the HLC timestamp, whose total
//! order breaks ties by node ID. Resolvers must be deterministic: the same
//! `(local, incoming)` pair always yields the same resolution, on every
//! node.

use crate::document::Document;
use crate::oplog::{OpKind, OplogEntry};

/// Outcome of resolving one incoming entry against local state.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Whether the incoming entry changes the stored document.
    pub should_apply: bool,
    /// The document state after applying, when `should_apply` is true.
    pub merged: Option<Document>,
}

impl Resolution {
    /// Keeps the local state untouched.
    pub fn skip() -> Self {
        Resolution { should_apply: false, merged: None }
    }

    /// Replaces the stored document.
    pub fn apply(doc: Document) -> Self {
        Resolution { should_apply: true, merged: Some(doc) }
    }
}

/// Decides whether an incoming oplog entry replaces the local document.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: Option<&Document>, incoming: &OplogEntry) -> Resolution;
}

/// Last-write-wins keyed on the HLC timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct LwwResolver;

impl ConflictResolver for LwwResolver {
    fn resolve(&self, local: Option<&Document>, incoming: &OplogEntry) -> Resolution {
        // A Put without payload carries no state and is never applied.
        if incoming.kind == OpKind::Put && incoming.payload.is_none() {
            return Resolution::skip();
        }

        if let Some(local) = local {
            if incoming.timestamp <= local.updated_at {
                return Resolution::skip();
            }
        }

        match incoming.kind {
            OpKind::Put => Resolution::apply(Document::new(
                incoming.collection.clone(),
                incoming.key.clone(),
                incoming.payload.clone().unwrap_or_default(),
                incoming.timestamp.clone(),
            )),
            OpKind::Delete => Resolution::apply(Document::tombstone(
                incoming.collection.clone(),
                incoming.key.clone(),
                local.and_then(|d| d.content.clone()),
                incoming.timestamp.clone(),
            )),
        }
    }
}

/// Folds a timestamp-sorted run of entries for one `(collection, key)` into
/// the stored document.
///
/// Returns the final document state (None when nothing applied and nothing
/// was stored) together with the entries that were not rejected outright.
/// Resolver-skipped entries are still returned: they are valid history from
/// their origin node and must be persisted to keep the chain intact. Only
/// payload-less Puts are dropped entirely.
pub fn fold_entries<'a>(
    resolver: &dyn ConflictResolver,
    local: Option<Document>,
    entries: impl IntoIterator<Item = &'a OplogEntry>,
) -> (Option<Document>, Vec<&'a OplogEntry>) {
    let mut state = local;
    let mut accepted = Vec::new();

    for entry in entries {
        if entry.kind == OpKind::Put && entry.payload.is_none() {
            continue;
        }
        let resolution = resolver.resolve(state.as_ref(), entry);
        if resolution.should_apply {
            state = resolution.merged;
        }
        accepted.push(entry);
    }

    (state, accepted)
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
