// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The abstract storage contract.
//!
//! A [`Store`] persists documents, the hash-chained oplog, per-node
//! snapshot boundaries, and remote peer configurations. Two backends ship
//! with the core: [`crate::memory::MemoryStore`] and
//! [`crate::sqlite::SqliteStore`]. Both support transactional
//! [`Store::apply_batch`], the single commit point where documents and
//! oplog entries become durable together.
//!
//! Stores also carry the process-wide mutable state the engine relies on:
//! an event hub for change notifications and the per-node
//! hash/timestamp cache backing [`Store::last_entry_hash`] and
//! [`Store::vector_clock`].

use std::collections::HashMap;
use std::sync::{mpsc, Mutex};

use crate::config::RemotePeerConfiguration;
use crate::document::{Document, DocumentMetadata};
use crate::error::Result;
use crate::hlc::Hlc;
use crate::oplog::{OplogEntry, SnapshotMetadata};
use crate::query::{json_cmp, lookup_path, Query};
use crate::vclock::VectorClock;

/// Change notifications emitted by a store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    DocumentsInserted { collection: String, documents: Vec<Document> },
    DocumentsUpdated { collection: String, documents: Vec<Document> },
    DocumentsDeleted { collection: String, keys: Vec<String> },
    /// Oplog entries became durable (local batch, sync apply, or import).
    ChangesApplied { entries: Vec<OplogEntry> },
}

/// Fan-out hub for [`StoreEvent`]s.
///
/// Subscribers get an unbounded channel; disconnected receivers are
/// dropped on the next publish.
#[derive(Default)]
pub struct EventHub {
    senders: Mutex<Vec<mpsc::Sender<StoreEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        self.senders.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
        rx
    }

    pub fn publish(&self, event: StoreEvent) {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Per-node `(latest_timestamp, latest_hash)` cache.
///
/// Initialized lazily from snapshot metadata and a max-per-node oplog
/// scan; the snapshot boundary wins only when it is at least as new as
/// the scanned entry. Cleared whenever the underlying state is replaced
/// wholesale.
#[derive(Default)]
pub struct NodeCache {
    inner: Mutex<Option<HashMap<String, (Hlc, String)>>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached tip for a node, loading the cache on first use.
    pub fn get_or_init<F>(&self, node_id: &str, load: F) -> Result<Option<(Hlc, String)>>
    where
        F: FnOnce() -> Result<HashMap<String, (Hlc, String)>>,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.is_none() {
            *inner = Some(load()?);
        }
        Ok(inner.as_ref().and_then(|map| map.get(node_id).cloned()))
    }

    /// Builds a vector clock from the cached tips, loading on first use.
    pub fn vector_clock_or_init<F>(&self, load: F) -> Result<VectorClock>
    where
        F: FnOnce() -> Result<HashMap<String, (Hlc, String)>>,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.is_none() {
            *inner = Some(load()?);
        }
        let mut clock = VectorClock::new();
        if let Some(map) = inner.as_ref() {
            for (ts, _) in map.values() {
                clock.observe(ts);
            }
        }
        Ok(clock)
    }

    /// Records a newly persisted entry tip if it advances the node.
    ///
    /// A cache that has not been initialized stays empty; the next read
    /// rebuilds it from the store, which already contains the entry.
    pub fn record(&self, ts: &Hlc, hash: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(map) = inner.as_mut() {
            match map.get(&ts.node_id) {
                Some((existing, _)) if *existing >= *ts => {}
                _ => {
                    map.insert(ts.node_id.clone(), (ts.clone(), hash.to_string()));
                }
            }
        }
    }

    /// Drops the cache; it is rebuilt lazily on the next read.
    pub fn clear(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Merges an oplog tip scan with snapshot boundaries into cache contents.
///
/// The snapshot boundary wins only when it is at least as new as the
/// scanned oplog tip for that node.
pub fn merge_cache_sources(
    oplog_tips: HashMap<String, (Hlc, String)>,
    boundaries: Vec<SnapshotMetadata>,
) -> HashMap<String, (Hlc, String)> {
    let mut map = oplog_tips;
    for meta in boundaries {
        let boundary_ts = meta.timestamp();
        match map.get(&meta.node_id) {
            Some((ts, _)) if *ts > boundary_ts => {}
            _ => {
                map.insert(meta.node_id.clone(), (boundary_ts, meta.hash));
            }
        }
    }
    map
}

/// Pagination and ordering for document queries.
#[derive(Debug, Clone)]
pub struct FindOptions {
    pub skip: usize,
    pub take: Option<usize>,
    /// Dot-separated property path to order by.
    pub order_by: Option<String>,
    pub ascending: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        FindOptions { skip: 0, take: None, order_by: None, ascending: true }
    }
}

/// Sorts and pages documents in memory, for backends that could not
/// push ordering into their query layer.
pub fn sort_and_page(mut docs: Vec<Document>, options: &FindOptions) -> Vec<Document> {
    if let Some(path) = &options.order_by {
        docs.sort_by(|a, b| {
            let av = a.content.as_ref().and_then(|c| lookup_path(c, path));
            let bv = b.content.as_ref().and_then(|c| lookup_path(c, path));
            let ord = match (av, bv) {
                (Some(x), Some(y)) => json_cmp(x, y).unwrap_or(std::cmp::Ordering::Equal),
                // Missing values sort last regardless of direction
                (None, Some(_)) => {
                    return std::cmp::Ordering::Greater;
                }
                (Some(_), None) => {
                    return std::cmp::Ordering::Less;
                }
                (None, None) => std::cmp::Ordering::Equal,
            };
            if options.ascending {
                ord
            } else {
                ord.reverse()
            }
        });
    }
    let iter = docs.into_iter().skip(options.skip);
    match options.take {
        Some(n) => iter.take(n).collect(),
        None => iter.collect(),
    }
}

/// The storage backend contract.
///
/// Implementations are internally synchronized: every method takes
/// `&self` and may be called from multiple threads. Write serialization
/// across the oplog is the caller's job (the database facade holds the
/// single writer permit).
pub trait Store: Send + Sync {
    // --- documents ---

    /// Upserts a document and emits the matching CDC event.
    fn save_document(&self, doc: &Document) -> Result<()>;

    /// Returns the stored record, tombstones included.
    fn get_document(&self, collection: &str, key: &str) -> Result<Option<Document>>;

    /// Live documents of a collection matching the query.
    fn query_documents(
        &self,
        collection: &str,
        query: Option<&Query>,
        options: &FindOptions,
    ) -> Result<Vec<Document>>;

    fn count_documents(&self, collection: &str, query: Option<&Query>) -> Result<usize>;

    /// Creates an index on a content property, where the backend supports it.
    fn ensure_index(&self, collection: &str, property_path: &str) -> Result<()>;

    fn collections(&self) -> Result<Vec<String>>;

    /// Every stored document, tombstones included. Snapshot export uses this.
    fn all_documents(&self) -> Result<Vec<Document>>;

    /// Last-write-wins upsert of documents arriving from a snapshot.
    ///
    /// Unlike [`Store::save_document`] this emits no CDC events: imported
    /// documents are remote history, not local mutations, and must not
    /// feed the oplog coordinator. Returns how many documents replaced
    /// or created local state.
    fn import_documents(&self, docs: &[Document]) -> Result<usize>;

    // --- document metadata ---

    fn document_metadata(&self, collection: &str, key: &str) -> Result<Option<DocumentMetadata>>;

    fn upsert_document_metadata(&self, meta: &DocumentMetadata) -> Result<()>;

    // --- oplog ---

    /// Appends a single entry; duplicate hashes are ignored.
    ///
    /// Returns true if the entry was new.
    fn append_oplog_entry(&self, entry: &OplogEntry) -> Result<bool>;

    /// Entries with timestamp strictly after `after`, optionally filtered
    /// by collection, sorted ascending.
    fn oplog_after(&self, after: &Hlc, collections: Option<&[String]>) -> Result<Vec<OplogEntry>>;

    /// Like [`Store::oplog_after`] restricted to one origin node.
    fn oplog_for_node_after(
        &self,
        node_id: &str,
        after: &Hlc,
        collections: Option<&[String]>,
    ) -> Result<Vec<OplogEntry>>;

    fn entry_by_hash(&self, hash: &str) -> Result<Option<OplogEntry>>;

    /// The contiguous chain segment of `node_id` after `start_hash`
    /// (exclusive) up to `end_hash` (inclusive).
    ///
    /// `start_hash` of "" means from the beginning of the retained chain.
    /// Returns None when the segment cannot be constructed, e.g. because
    /// it was pruned.
    fn chain_range(
        &self,
        node_id: &str,
        start_hash: &str,
        end_hash: &str,
    ) -> Result<Option<Vec<OplogEntry>>>;

    /// Hash of the newest entry from `node_id`, from the cache.
    fn last_entry_hash(&self, node_id: &str) -> Result<Option<String>>;

    /// The newest timestamp across all nodes.
    fn latest_timestamp(&self) -> Result<Option<Hlc>>;

    /// Vector clock over per-node tips, from the cache.
    fn vector_clock(&self) -> Result<VectorClock>;

    // --- atomic batch ---

    /// Atomically applies documents and oplog entries.
    ///
    /// Entries are grouped per `(collection, key)`, sorted by timestamp,
    /// and folded into the stored document through the LWW resolver.
    /// Entries already present (by hash) are skipped. Returns the number
    /// of entries newly persisted. Emits `ChangesApplied` on success.
    ///
    /// Documents in `docs` with no matching entry are inserted when
    /// absent (an import affordance); the write paths pass entries only,
    /// since the fold derives all document state from them.
    fn apply_batch(&self, docs: &[Document], entries: &[OplogEntry]) -> Result<usize>;

    // --- pruning & snapshot boundaries ---

    /// Removes oplog entries with timestamp strictly before `cutoff`,
    /// recording the latest pruned entry per node as its snapshot
    /// boundary. Returns the number of entries removed.
    fn prune_oplog(&self, cutoff: &Hlc) -> Result<usize>;

    fn snapshot_metadata(&self, node_id: &str) -> Result<Option<SnapshotMetadata>>;

    fn all_snapshot_metadata(&self) -> Result<Vec<SnapshotMetadata>>;

    fn update_snapshot_metadata(&self, meta: &SnapshotMetadata) -> Result<()>;

    /// Convenience accessor for the boundary hash of a node.
    fn snapshot_hash(&self, node_id: &str) -> Result<Option<String>> {
        Ok(self.snapshot_metadata(node_id)?.map(|meta| meta.hash))
    }

    // --- remote peers ---

    fn save_remote_peer(&self, peer: &RemotePeerConfiguration) -> Result<()>;

    fn remote_peers(&self) -> Result<Vec<RemotePeerConfiguration>>;

    fn remote_peer(&self, node_id: &str) -> Result<Option<RemotePeerConfiguration>>;

    fn remove_remote_peer(&self, node_id: &str) -> Result<()>;

    // --- events & lifecycle ---

    fn events(&self) -> &EventHub;

    /// Clears all persisted state. Used by snapshot replace.
    fn clear(&self) -> Result<()>;
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
