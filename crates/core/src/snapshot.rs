// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Full-state snapshots and oplog truncation.
//!
//! A snapshot is a versioned JSON export of the entire store: documents,
//! oplog, per-node snapshot boundaries, and remote peers. It can replace a
//! store wholesale (bootstrap) or be merged into one (fallback sync, which
//! must preserve local-only divergent history).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::info;

use crate::config::RemotePeerConfiguration;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::oplog::{OplogEntry, SnapshotMetadata};
use crate::store::Store;

/// Current snapshot stream version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A complete export of a node's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// Node that produced the export.
    pub node_id: String,
    pub documents: Vec<Document>,
    pub oplog: Vec<OplogEntry>,
    pub snapshot_metadata: Vec<SnapshotMetadata>,
    pub remote_peers: Vec<RemotePeerConfiguration>,
}

/// Counters describing what a merge changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub documents_applied: usize,
    pub entries_added: usize,
    pub peers_added: usize,
}

/// Exports the full store state.
pub fn export(store: &dyn Store, node_id: &str) -> Result<Snapshot> {
    Ok(Snapshot {
        version: SNAPSHOT_VERSION,
        created_at: Utc::now(),
        node_id: node_id.to_string(),
        documents: store.all_documents()?,
        oplog: store.oplog_after(&Hlc::zero(), None)?,
        snapshot_metadata: store.all_snapshot_metadata()?,
        remote_peers: store.remote_peers()?,
    })
}

/// Serializes a snapshot to a writer as JSON.
pub fn write_to(snapshot: &Snapshot, writer: impl Write) -> Result<()> {
    serde_json::to_writer(writer, snapshot)?;
    Ok(())
}

/// Deserializes and version-checks a snapshot.
pub fn read_from(reader: impl Read) -> Result<Snapshot> {
    let snapshot: Snapshot = serde_json::from_reader(reader)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(Error::UnsupportedSnapshotVersion(snapshot.version));
    }
    Ok(snapshot)
}

/// Replaces the entire store with the snapshot contents.
///
/// Local state is discarded; the hash cache is invalidated and rebuilt
/// lazily from the imported data.
pub fn replace(store: &dyn Store, snapshot: &Snapshot) -> Result<()> {
    store.clear()?;

    store.import_documents(&snapshot.documents)?;
    for entry in &snapshot.oplog {
        store.append_oplog_entry(entry)?;
    }
    for meta in &snapshot.snapshot_metadata {
        store.update_snapshot_metadata(meta)?;
    }
    for peer in &snapshot.remote_peers {
        store.save_remote_peer(peer)?;
    }

    // ChangesApplied fires per appended entry above.
    info!(
        documents = snapshot.documents.len(),
        entries = snapshot.oplog.len(),
        "replaced store from snapshot"
    );
    Ok(())
}

/// Merges snapshot contents into the store without discarding local state.
///
/// Documents and snapshot boundaries merge last-write-wins by timestamp;
/// oplog entries are added when their hash is absent; remote peers are
/// added when their node ID is absent.
pub fn merge(store: &dyn Store, snapshot: &Snapshot) -> Result<MergeStats> {
    let mut stats = MergeStats::default();

    stats.documents_applied = store.import_documents(&snapshot.documents)?;

    let mut added = Vec::new();
    for entry in &snapshot.oplog {
        if store.append_oplog_entry(entry)? {
            added.push(entry.clone());
        }
    }
    stats.entries_added = added.len();

    for meta in &snapshot.snapshot_metadata {
        let keep_local = store
            .snapshot_metadata(&meta.node_id)?
            .is_some_and(|local| local.timestamp() >= meta.timestamp());
        if !keep_local {
            store.update_snapshot_metadata(meta)?;
        }
    }

    for peer in &snapshot.remote_peers {
        if store.remote_peer(&peer.node_id)?.is_none() {
            store.save_remote_peer(peer)?;
            stats.peers_added += 1;
        }
    }

    info!(
        documents = stats.documents_applied,
        entries = stats.entries_added,
        "merged snapshot into store"
    );
    Ok(stats)
}

/// Computes the prune cutoff for a retention window ending now.
pub fn retention_cutoff(now_ms: i64, retention_hours: u32) -> Hlc {
    let window_ms = i64::from(retention_hours) * 60 * 60 * 1000;
    Hlc::new(now_ms.saturating_sub(window_ms), 0, "")
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
