// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Change-data-capture fallback for the oplog.
//!
//! Backends with transactional [`Store::apply_batch`] never need this: the
//! database facade writes document and oplog entry in one commit. For a
//! backend that cannot co-commit, the [`OplogCoordinator`] subscribes to
//! the store's document events and appends the matching oplog entries
//! after the fact.
//!
//! Failed appends are queued and retried on the next pump; they are never
//! dropped, so a document mutation is eventually always paired with its
//! oplog entry.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::document::DocumentMetadata;
use crate::error::Result;
use crate::hlc::{ClockSource, HlcClock, SystemClock};
use crate::oplog::{OpKind, OplogEntry};
use crate::store::{Store, StoreEvent};

#[derive(Debug)]
struct PendingOp {
    collection: String,
    key: String,
    kind: OpKind,
    payload: Option<serde_json::Value>,
}

/// Appends oplog entries for observed document mutations.
pub struct OplogCoordinator<C: ClockSource = SystemClock> {
    store: Arc<dyn Store>,
    clock: Arc<HlcClock<C>>,
    events: mpsc::Receiver<StoreEvent>,
    pending: VecDeque<PendingOp>,
}

impl<C: ClockSource> OplogCoordinator<C> {
    /// Subscribes to the store's event stream.
    pub fn new(store: Arc<dyn Store>, clock: Arc<HlcClock<C>>) -> Self {
        let events = store.events().subscribe();
        OplogCoordinator { store, clock, events, pending: VecDeque::new() }
    }

    /// Number of mutations waiting for an oplog append.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drains received events and appends oplog entries for them.
    ///
    /// Returns the number of entries appended. Append failures leave the
    /// mutation queued for the next pump.
    pub fn pump(&mut self) -> Result<usize> {
        while let Ok(event) = self.events.try_recv() {
            self.enqueue(event);
        }

        let mut appended = 0;
        while let Some(op) = self.pending.pop_front() {
            match self.append(&op) {
                Ok(()) => appended += 1,
                Err(err) => {
                    warn!(
                        collection = %op.collection,
                        key = %op.key,
                        %err,
                        "oplog append failed, will retry"
                    );
                    self.pending.push_front(op);
                    return Err(err);
                }
            }
        }
        Ok(appended)
    }

    fn enqueue(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::DocumentsInserted { documents, .. }
            | StoreEvent::DocumentsUpdated { documents, .. } => {
                for doc in documents {
                    // Documents stamped by another node came in through
                    // sync or import; their history already exists.
                    if doc.updated_at.node_id != self.clock.node_id() {
                        continue;
                    }
                    self.pending.push_back(PendingOp {
                        collection: doc.collection,
                        key: doc.key,
                        kind: OpKind::Put,
                        payload: doc.content,
                    });
                }
            }
            StoreEvent::DocumentsDeleted { collection, keys } => {
                for key in keys {
                    let foreign = self
                        .store
                        .get_document(&collection, &key)
                        .ok()
                        .flatten()
                        .is_some_and(|doc| doc.updated_at.node_id != self.clock.node_id());
                    if foreign {
                        continue;
                    }
                    self.pending.push_back(PendingOp {
                        collection: collection.clone(),
                        key,
                        kind: OpKind::Delete,
                        payload: None,
                    });
                }
            }
            StoreEvent::ChangesApplied { .. } => {
                // Oplog entries are what this coordinator produces, not
                // what it consumes.
            }
        }
    }

    fn append(&self, op: &PendingOp) -> Result<()> {
        let timestamp = self.clock.now();
        let previous = self
            .store
            .last_entry_hash(self.clock.node_id())?
            .unwrap_or_default();

        let entry = OplogEntry::new(
            op.collection.clone(),
            op.key.clone(),
            op.kind,
            op.payload.clone(),
            timestamp.clone(),
            previous,
        );
        self.store.append_oplog_entry(&entry)?;
        self.store.upsert_document_metadata(&DocumentMetadata {
            collection: op.collection.clone(),
            key: op.key.clone(),
            updated_at: timestamp,
            is_deleted: op.kind == OpKind::Delete,
        })?;

        debug!(collection = %op.collection, key = %op.key, kind = %op.kind, "coordinated oplog append");
        Ok(())
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
