// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory storage backend.
//!
//! Implements the full [`Store`] contract over locked maps. Used for tests
//! and for embedding scenarios that do not need durability.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use crate::config::RemotePeerConfiguration;
use crate::document::{Document, DocumentMetadata};
use crate::error::Result;
use crate::hlc::Hlc;
use crate::oplog::{OplogEntry, SnapshotMetadata};
use crate::query::Query;
use crate::resolver::{fold_entries, LwwResolver};
use crate::store::{
    merge_cache_sources, sort_and_page, EventHub, FindOptions, NodeCache, Store, StoreEvent,
};
use crate::vclock::VectorClock;

#[derive(Default)]
struct Inner {
    docs: BTreeMap<(String, String), Document>,
    doc_meta: BTreeMap<(String, String), DocumentMetadata>,
    /// Kept sorted by timestamp.
    oplog: Vec<OplogEntry>,
    oplog_hashes: HashSet<String>,
    snapshot_meta: BTreeMap<String, SnapshotMetadata>,
    peers: BTreeMap<String, RemotePeerConfiguration>,
}

impl Inner {
    fn insert_entry(&mut self, entry: &OplogEntry) -> bool {
        if self.oplog_hashes.contains(&entry.hash) {
            return false;
        }
        let pos = self
            .oplog
            .partition_point(|existing| existing.timestamp <= entry.timestamp);
        self.oplog.insert(pos, entry.clone());
        self.oplog_hashes.insert(entry.hash.clone());
        true
    }

    fn node_entries(&self, node_id: &str) -> Vec<&OplogEntry> {
        self.oplog.iter().filter(|e| e.node_id() == node_id).collect()
    }

    fn cache_contents(&self) -> HashMap<String, (Hlc, String)> {
        let mut tips: HashMap<String, (Hlc, String)> = HashMap::new();
        for entry in &self.oplog {
            match tips.get(entry.node_id()) {
                Some((ts, _)) if *ts >= entry.timestamp => {}
                _ => {
                    tips.insert(
                        entry.node_id().to_string(),
                        (entry.timestamp.clone(), entry.hash.clone()),
                    );
                }
            }
        }
        merge_cache_sources(tips, self.snapshot_meta.values().cloned().collect())
    }
}

/// A [`Store`] that lives entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    cache: NodeCache,
    events: EventHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn save_document(&self, doc: &Document) -> Result<()> {
        let event = {
            let mut inner = self.write();
            let slot = (doc.collection.clone(), doc.key.clone());
            let previous = inner.docs.insert(slot, doc.clone());

            if doc.is_deleted {
                StoreEvent::DocumentsDeleted {
                    collection: doc.collection.clone(),
                    keys: vec![doc.key.clone()],
                }
            } else if previous.is_some_and(|p| !p.is_deleted) {
                StoreEvent::DocumentsUpdated {
                    collection: doc.collection.clone(),
                    documents: vec![doc.clone()],
                }
            } else {
                StoreEvent::DocumentsInserted {
                    collection: doc.collection.clone(),
                    documents: vec![doc.clone()],
                }
            }
        };
        self.events.publish(event);
        Ok(())
    }

    fn get_document(&self, collection: &str, key: &str) -> Result<Option<Document>> {
        Ok(self.read().docs.get(&(collection.to_string(), key.to_string())).cloned())
    }

    fn query_documents(
        &self,
        collection: &str,
        query: Option<&Query>,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let docs: Vec<Document> = self
            .read()
            .docs
            .values()
            .filter(|doc| doc.collection == collection && !doc.is_deleted)
            .filter(|doc| match (query, &doc.content) {
                (None, _) => true,
                (Some(q), Some(content)) => q.matches(content),
                (Some(_), None) => false,
            })
            .cloned()
            .collect();
        Ok(sort_and_page(docs, options))
    }

    fn count_documents(&self, collection: &str, query: Option<&Query>) -> Result<usize> {
        Ok(self
            .read()
            .docs
            .values()
            .filter(|doc| doc.collection == collection && !doc.is_deleted)
            .filter(|doc| match (query, &doc.content) {
                (None, _) => true,
                (Some(q), Some(content)) => q.matches(content),
                (Some(_), None) => false,
            })
            .count())
    }

    fn ensure_index(&self, _collection: &str, _property_path: &str) -> Result<()> {
        // Scans are already as fast as this backend gets.
        Ok(())
    }

    fn collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> =
            self.read().docs.keys().map(|(collection, _)| collection.clone()).collect();
        names.dedup();
        Ok(names)
    }

    fn all_documents(&self) -> Result<Vec<Document>> {
        Ok(self.read().docs.values().cloned().collect())
    }

    fn import_documents(&self, docs: &[Document]) -> Result<usize> {
        let mut inner = self.write();
        let mut applied = 0;
        for doc in docs {
            let slot = (doc.collection.clone(), doc.key.clone());
            let keep_local = inner
                .docs
                .get(&slot)
                .is_some_and(|local| local.updated_at >= doc.updated_at);
            if keep_local {
                continue;
            }
            inner.doc_meta.insert(slot.clone(), DocumentMetadata::of(doc));
            inner.docs.insert(slot, doc.clone());
            applied += 1;
        }
        Ok(applied)
    }

    fn document_metadata(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<DocumentMetadata>> {
        Ok(self.read().doc_meta.get(&(collection.to_string(), key.to_string())).cloned())
    }

    fn upsert_document_metadata(&self, meta: &DocumentMetadata) -> Result<()> {
        self.write()
            .doc_meta
            .insert((meta.collection.clone(), meta.key.clone()), meta.clone());
        Ok(())
    }

    fn append_oplog_entry(&self, entry: &OplogEntry) -> Result<bool> {
        let inserted = self.write().insert_entry(entry);
        if inserted {
            self.cache.record(&entry.timestamp, &entry.hash);
            self.events.publish(StoreEvent::ChangesApplied { entries: vec![entry.clone()] });
        }
        Ok(inserted)
    }

    fn oplog_after(&self, after: &Hlc, collections: Option<&[String]>) -> Result<Vec<OplogEntry>> {
        Ok(self
            .read()
            .oplog
            .iter()
            .filter(|e| e.timestamp > *after)
            .filter(|e| collections.map_or(true, |cols| cols.iter().any(|c| *c == e.collection)))
            .cloned()
            .collect())
    }

    fn oplog_for_node_after(
        &self,
        node_id: &str,
        after: &Hlc,
        collections: Option<&[String]>,
    ) -> Result<Vec<OplogEntry>> {
        Ok(self
            .read()
            .oplog
            .iter()
            .filter(|e| e.node_id() == node_id && e.timestamp > *after)
            .filter(|e| collections.map_or(true, |cols| cols.iter().any(|c| *c == e.collection)))
            .cloned()
            .collect())
    }

    fn entry_by_hash(&self, hash: &str) -> Result<Option<OplogEntry>> {
        Ok(self.read().oplog.iter().find(|e| e.hash == hash).cloned())
    }

    fn chain_range(
        &self,
        node_id: &str,
        start_hash: &str,
        end_hash: &str,
    ) -> Result<Option<Vec<OplogEntry>>> {
        let inner = self.read();
        let chain = inner.node_entries(node_id);

        let begin = if start_hash.is_empty() {
            0
        } else if let Some(idx) = chain.iter().position(|e| e.hash == start_hash) {
            idx + 1
        } else if inner
            .snapshot_meta
            .get(node_id)
            .is_some_and(|meta| meta.hash == start_hash)
        {
            // The requested start is the truncation boundary; the retained
            // chain begins right after it.
            0
        } else {
            return Ok(None);
        };

        let mut range = Vec::new();
        for entry in &chain[begin..] {
            range.push((*entry).clone());
            if entry.hash == end_hash {
                return Ok(Some(range));
            }
        }
        Ok(None)
    }

    fn last_entry_hash(&self, node_id: &str) -> Result<Option<String>> {
        let tip = self
            .cache
            .get_or_init(node_id, || Ok(self.read().cache_contents()))?;
        Ok(tip.map(|(_, hash)| hash))
    }

    fn latest_timestamp(&self) -> Result<Option<Hlc>> {
        let clock = self.vector_clock()?;
        Ok(clock.iter().map(|(_, ts)| ts.clone()).max())
    }

    fn vector_clock(&self) -> Result<VectorClock> {
        self.cache.vector_clock_or_init(|| Ok(self.read().cache_contents()))
    }

    fn apply_batch(&self, docs: &[Document], entries: &[OplogEntry]) -> Result<usize> {
        let (persisted, events) = {
            let mut inner = self.write();

            // Group entries per key, preserving timestamp order.
            let mut by_key: BTreeMap<(String, String), Vec<&OplogEntry>> = BTreeMap::new();
            for entry in entries {
                by_key
                    .entry((entry.collection.clone(), entry.key.clone()))
                    .or_default()
                    .push(entry);
            }

            let mut persisted: Vec<OplogEntry> = Vec::new();
            let mut inserted: Vec<Document> = Vec::new();
            let mut updated: Vec<Document> = Vec::new();
            let mut deleted: Vec<(String, String)> = Vec::new();

            for ((collection, key), mut run) in by_key {
                run.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
                let slot = (collection.clone(), key.clone());
                let local = inner.docs.get(&slot).cloned();
                let had_live = local.as_ref().is_some_and(|d| !d.is_deleted);

                let (state, accepted) = fold_entries(&LwwResolver, local, run);

                for entry in accepted {
                    if inner.insert_entry(entry) {
                        persisted.push(entry.clone());
                    }
                }

                if let Some(doc) = state {
                    inner.doc_meta.insert(slot.clone(), DocumentMetadata::of(&doc));
                    if doc.is_deleted {
                        if had_live {
                            deleted.push((collection, key));
                        }
                    } else if had_live {
                        updated.push(doc.clone());
                    } else {
                        inserted.push(doc.clone());
                    }
                    inner.docs.insert(slot, doc);
                }
            }

            // Documents without a matching entry are stored as-is (import path).
            for doc in docs {
                let slot = (doc.collection.clone(), doc.key.clone());
                if !inner.docs.contains_key(&slot) {
                    inner.doc_meta.insert(slot.clone(), DocumentMetadata::of(doc));
                    inner.docs.insert(slot, doc.clone());
                }
            }

            let mut events = Vec::new();
            for doc in &inserted {
                events.push(StoreEvent::DocumentsInserted {
                    collection: doc.collection.clone(),
                    documents: vec![doc.clone()],
                });
            }
            for doc in &updated {
                events.push(StoreEvent::DocumentsUpdated {
                    collection: doc.collection.clone(),
                    documents: vec![doc.clone()],
                });
            }
            for (collection, key) in deleted {
                events.push(StoreEvent::DocumentsDeleted { collection, keys: vec![key] });
            }
            if !persisted.is_empty() {
                events.push(StoreEvent::ChangesApplied { entries: persisted.clone() });
            }

            (persisted, events)
        };

        // Outside the map lock: the cache loader takes the locks in the
        // opposite order.
        for entry in &persisted {
            self.cache.record(&entry.timestamp, &entry.hash);
        }
        for event in events {
            self.events.publish(event);
        }
        Ok(persisted.len())
    }

    fn prune_oplog(&self, cutoff: &Hlc) -> Result<usize> {
        let mut inner = self.write();

        let mut boundaries: HashMap<String, SnapshotMetadata> = HashMap::new();
        let mut kept = Vec::with_capacity(inner.oplog.len());
        let mut removed = 0usize;

        for entry in std::mem::take(&mut inner.oplog) {
            if entry.timestamp < *cutoff {
                // Entries are sorted ascending, so the last one seen per
                // node is the latest pruned entry.
                boundaries
                    .insert(entry.node_id().to_string(), SnapshotMetadata::of_entry(&entry));
                inner.oplog_hashes.remove(&entry.hash);
                removed += 1;
            } else {
                kept.push(entry);
            }
        }
        inner.oplog = kept;

        for (node_id, meta) in boundaries {
            let newer_exists = inner
                .snapshot_meta
                .get(&node_id)
                .is_some_and(|existing| existing.timestamp() > meta.timestamp());
            if !newer_exists {
                inner.snapshot_meta.insert(node_id, meta);
            }
        }

        Ok(removed)
    }

    fn snapshot_metadata(&self, node_id: &str) -> Result<Option<SnapshotMetadata>> {
        Ok(self.read().snapshot_meta.get(node_id).cloned())
    }

    fn all_snapshot_metadata(&self) -> Result<Vec<SnapshotMetadata>> {
        Ok(self.read().snapshot_meta.values().cloned().collect())
    }

    fn update_snapshot_metadata(&self, meta: &SnapshotMetadata) -> Result<()> {
        self.write().snapshot_meta.insert(meta.node_id.clone(), meta.clone());
        self.cache.clear();
        Ok(())
    }

    fn save_remote_peer(&self, peer: &RemotePeerConfiguration) -> Result<()> {
        self.write().peers.insert(peer.node_id.clone(), peer.clone());
        Ok(())
    }

    fn remote_peers(&self) -> Result<Vec<RemotePeerConfiguration>> {
        Ok(self.read().peers.values().cloned().collect())
    }

    fn remote_peer(&self, node_id: &str) -> Result<Option<RemotePeerConfiguration>> {
        Ok(self.read().peers.get(node_id).cloned())
    }

    fn remove_remote_peer(&self, node_id: &str) -> Result<()> {
        self.write().peers.remove(node_id);
        Ok(())
    }

    fn events(&self) -> &EventHub {
        &self.events
    }

    fn clear(&self) -> Result<()> {
        *self.write() = Inner::default();
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
