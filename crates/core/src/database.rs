// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The database facade.
//!
//! [`PeerDatabase`] is what applications hold: typed and untyped collection
//! access, batch writes, and queries. Every mutation runs under a single
//! writer permit, builds the document and its hash-linked oplog entry, and
//! commits both through the store's atomic batch. Sync applies inbound
//! batches through the same permit, so the local chain is a true sequence.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::config::NodeConfig;
use crate::document::Document;
use crate::error::Result;
use crate::hlc::{ClockSource, Hlc, HlcClock, SystemClock};
use crate::oplog::{OpKind, OplogEntry};
use crate::query::Query;
use crate::store::{FindOptions, Store};
use crate::vclock::VectorClock;

/// Embeddable peer database over a storage backend.
pub struct PeerDatabase {
    store: Arc<dyn Store>,
    clock: Arc<HlcClock<Box<dyn ClockSource>>>,
    config: NodeConfig,
    /// The single writer permit. Every path that appends to the oplog
    /// holds it for the duration of the commit.
    write_permit: Mutex<()>,
}

impl PeerDatabase {
    /// Opens the database over a store with the system clock.
    pub fn new(store: Arc<dyn Store>, config: NodeConfig) -> Result<Self> {
        Self::with_clock_source(store, config, Box::new(SystemClock))
    }

    /// Opens the database with an injected clock source.
    pub fn with_clock_source(
        store: Arc<dyn Store>,
        config: NodeConfig,
        clock_source: Box<dyn ClockSource>,
    ) -> Result<Self> {
        config.validate()?;
        let clock = Arc::new(HlcClock::with_clock(clock_source, config.node_id.clone()));
        Ok(PeerDatabase { store, clock, config, write_permit: Mutex::new(()) })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The node's current vector clock.
    pub fn vector_clock(&self) -> Result<VectorClock> {
        self.store.vector_clock()
    }

    /// An untyped handle to one collection.
    pub fn collection(&self, name: impl Into<String>) -> Collection<'_> {
        Collection { db: self, name: name.into() }
    }

    fn permit(&self) -> MutexGuard<'_, ()> {
        self.write_permit.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores a document, returning the write timestamp.
    ///
    /// Writing identical content over a live document is a no-op and
    /// returns the existing timestamp without growing the oplog.
    pub fn put(&self, collection: &str, key: &str, content: Value) -> Result<Hlc> {
        let _permit = self.permit();
        self.put_locked(collection, key, content)
    }

    /// Stores several documents as one atomic batch.
    ///
    /// Entries chain within the batch and their timestamps are strictly
    /// ascending; the clock re-ticks whenever the wall clock advances
    /// mid-batch.
    pub fn put_many(&self, collection: &str, items: Vec<(String, Value)>) -> Result<Vec<Hlc>> {
        let _permit = self.permit();

        let mut previous = self
            .store
            .last_entry_hash(self.node_id())?
            .unwrap_or_default();
        let mut entries = Vec::new();
        let mut timestamps = Vec::new();

        for (key, content) in items {
            if let Some(existing) = self.unchanged_timestamp(collection, &key, &content)? {
                timestamps.push(existing);
                continue;
            }
            let timestamp = self.clock.now();
            let entry = OplogEntry::new(
                collection,
                key,
                OpKind::Put,
                Some(content),
                timestamp.clone(),
                previous.clone(),
            );
            previous = entry.hash.clone();
            timestamps.push(timestamp);
            entries.push(entry);
        }

        if !entries.is_empty() {
            self.store.apply_batch(&[], &entries)?;
        }
        Ok(timestamps)
    }

    /// Deletes a document, leaving a tombstone.
    ///
    /// Returns false when there was nothing live to delete.
    pub fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let _permit = self.permit();
        self.delete_locked(collection, key)
    }

    /// Deletes several documents as one atomic batch.
    ///
    /// Returns how many were live before.
    pub fn delete_many(&self, collection: &str, keys: &[String]) -> Result<usize> {
        let _permit = self.permit();

        let mut previous = self
            .store
            .last_entry_hash(self.node_id())?
            .unwrap_or_default();
        let mut entries = Vec::new();

        for key in keys {
            let live = self
                .store
                .get_document(collection, key)?
                .is_some_and(|doc| !doc.is_deleted);
            if !live {
                continue;
            }
            let timestamp = self.clock.now();
            let entry = OplogEntry::new(
                collection,
                key.clone(),
                OpKind::Delete,
                None,
                timestamp,
                previous.clone(),
            );
            previous = entry.hash.clone();
            entries.push(entry);
        }

        if entries.is_empty() {
            return Ok(0);
        }
        self.store.apply_batch(&[], &entries)?;
        Ok(entries.len())
    }

    /// Returns a live document; tombstones and missing keys are both None.
    pub fn get(&self, collection: &str, key: &str) -> Result<Option<Document>> {
        Ok(self
            .store
            .get_document(collection, key)?
            .filter(|doc| !doc.is_deleted))
    }

    /// Like [`PeerDatabase::get`], deserializing the content.
    pub fn get_as<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        match self.get(collection, key)? {
            Some(Document { content: Some(content), .. }) => {
                Ok(Some(serde_json::from_value(content)?))
            }
            _ => Ok(None),
        }
    }

    pub fn find(
        &self,
        collection: &str,
        query: Option<&Query>,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.store.query_documents(collection, query, options)
    }

    pub fn count(&self, collection: &str, query: Option<&Query>) -> Result<usize> {
        self.store.count_documents(collection, query)
    }

    pub fn ensure_index(&self, collection: &str, property_path: &str) -> Result<()> {
        self.store.ensure_index(collection, property_path)
    }

    /// Applies validated inbound oplog entries under the writer permit and
    /// advances the local clock past them.
    ///
    /// Chain validation belongs to the sync layer; this is the commit
    /// point it uses once a batch has passed.
    pub fn apply_remote_batch(&self, entries: &[OplogEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        let _permit = self.permit();
        let applied = self.store.apply_batch(&[], entries)?;
        if let Some(max_ts) = entries.iter().map(|e| &e.timestamp).max() {
            let _ = self.clock.receive(max_ts);
        }
        debug!(applied, "applied remote batch");
        Ok(applied)
    }

    fn put_locked(&self, collection: &str, key: &str, content: Value) -> Result<Hlc> {
        if let Some(existing) = self.unchanged_timestamp(collection, key, &content)? {
            debug!(collection, key, "put skipped, content unchanged");
            return Ok(existing);
        }

        let timestamp = self.clock.now();
        let previous = self
            .store
            .last_entry_hash(self.node_id())?
            .unwrap_or_default();
        let entry = OplogEntry::new(
            collection,
            key,
            OpKind::Put,
            Some(content),
            timestamp.clone(),
            previous,
        );

        // The stored document state is derived from the entry by the
        // resolver fold; the docs side of the batch is import-only.
        self.store.apply_batch(&[], std::slice::from_ref(&entry))?;
        Ok(timestamp)
    }

    fn delete_locked(&self, collection: &str, key: &str) -> Result<bool> {
        let live = self
            .store
            .get_document(collection, key)?
            .is_some_and(|doc| !doc.is_deleted);
        if !live {
            return Ok(false);
        }

        let timestamp = self.clock.now();
        let previous = self
            .store
            .last_entry_hash(self.node_id())?
            .unwrap_or_default();
        let entry = OplogEntry::new(collection, key, OpKind::Delete, None, timestamp, previous);

        self.store.apply_batch(&[], std::slice::from_ref(&entry))?;
        Ok(true)
    }

    /// Returns the existing timestamp when a put would not change content.
    fn unchanged_timestamp(
        &self,
        collection: &str,
        key: &str,
        content: &Value,
    ) -> Result<Option<Hlc>> {
        let existing = self.store.get_document(collection, key)?;
        Ok(existing
            .filter(|doc| !doc.is_deleted)
            .filter(|doc| {
                let candidate =
                    Document::new(collection, key, content.clone(), doc.updated_at.clone());
                doc.content_hash() == candidate.content_hash()
            })
            .map(|doc| doc.updated_at))
    }
}

/// A named-collection view over the database.
pub struct Collection<'a> {
    db: &'a PeerDatabase,
    name: String,
}

impl Collection<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serializes and stores a value.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<Hlc> {
        let content = serde_json::to_value(value)?;
        self.db.put(&self.name, key, content)
    }

    /// Fetches and deserializes a value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.db.get_as(&self.name, key)
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.db.delete(&self.name, key)
    }

    pub fn find(&self, query: Option<&Query>, options: &FindOptions) -> Result<Vec<Document>> {
        self.db.find(&self.name, query, options)
    }

    pub fn count(&self, query: Option<&Query>) -> Result<usize> {
        self.db.count(&self.name, query)
    }
}

#[cfg(test)]
#[path = "database_tests.rs"]
mod tests;
