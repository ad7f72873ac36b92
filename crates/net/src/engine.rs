// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The transport-independent sync engine.
//!
//! Given two vector clocks it plans what to pull and push; given an
//! inbound batch it validates entry hashes and chain continuity, detects
//! gaps, and decides between applying, requesting a chain range, or
//! escalating to a full snapshot. All checks are side-effect-free;
//! mutation happens only once an entire batch has passed, through the
//! database facade's writer permit.
//!
//! Gap recovery is bounded: one chain-range round trip per batch. A gap
//! that survives it escalates to `SnapshotRequired` instead of looping.

use std::sync::Arc;
use tracing::{debug, warn};

use entgl_core::{Error, Hlc, OplogEntry, PeerDatabase, VectorClock};

use crate::error::Result;
use crate::protocol::SyncMessage;

/// What a vector-clock comparison says this side should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    /// `(origin node, pull entries strictly after this timestamp)`.
    pub pull: Vec<(String, Hlc)>,
    /// `(origin node, push entries strictly after this timestamp)`.
    pub push: Vec<(String, Hlc)>,
}

impl SyncPlan {
    pub fn is_converged(&self) -> bool {
        self.pull.is_empty() && self.push.is_empty()
    }
}

/// Computes the pull/push plan from a pair of vector clocks.
pub fn plan(local: &VectorClock, remote: &VectorClock) -> SyncPlan {
    let pull = local
        .nodes_with_updates_in(remote)
        .into_iter()
        .map(|node| {
            let since = local.get_or_zero(&node);
            (node, since)
        })
        .collect();
    let push = local
        .nodes_to_push_to(remote)
        .into_iter()
        .map(|node| {
            let since = remote.get_or_zero(&node);
            (node, since)
        })
        .collect();
    SyncPlan { pull, push }
}

/// Outcome of processing one inbound batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Entries were applied (possibly zero, when everything was known).
    Applied(usize),
    /// A gap was found; fetch this chain segment and retry once.
    NeedRange {
        node_id: String,
        start_hash: String,
        end_hash: String,
    },
    /// The gap cannot be closed incrementally.
    SnapshotRequired { node_id: String },
}

/// Chain validation and application of inbound entries.
pub struct SyncEngine {
    db: Arc<PeerDatabase>,
}

impl SyncEngine {
    pub fn new(db: Arc<PeerDatabase>) -> Self {
        SyncEngine { db }
    }

    pub fn db(&self) -> &Arc<PeerDatabase> {
        &self.db
    }

    /// Validates and applies a batch of entries from one origin node.
    ///
    /// Entries outside this node's interested collections are dropped
    /// with a warning. When a collection filter is active the chain is by
    /// construction sparse, so continuity is not enforced; every entry is
    /// still individually hash-verified.
    pub fn process_inbound_batch(
        &self,
        origin: &str,
        entries: &[OplogEntry],
    ) -> Result<BatchOutcome> {
        let mut batch = self.filter_and_verify(origin, entries)?;
        if batch.is_empty() {
            return Ok(BatchOutcome::Applied(0));
        }
        batch.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        // Replays of already-stored entries are dropped up front so a
        // resend cannot masquerade as a gap.
        let mut fresh = Vec::with_capacity(batch.len());
        for entry in batch {
            if self.db.store().entry_by_hash(&entry.hash)?.is_none() {
                fresh.push(entry);
            }
        }
        if fresh.is_empty() {
            return Ok(BatchOutcome::Applied(0));
        }

        if self.chain_is_strict() {
            if let Some(outcome) = self.check_continuity(origin, &fresh)? {
                return Ok(outcome);
            }
        }

        let applied = self.db.apply_remote_batch(&fresh)?;
        Ok(BatchOutcome::Applied(applied))
    }

    /// Retries a gapped batch with the chain segment the peer supplied.
    ///
    /// An empty or still-discontinuous range escalates to
    /// `SnapshotRequired`; there is no second range round trip.
    pub fn apply_with_range(
        &self,
        origin: &str,
        range: &[OplogEntry],
        pending: &[OplogEntry],
    ) -> Result<BatchOutcome> {
        if range.is_empty() {
            return Ok(BatchOutcome::SnapshotRequired { node_id: origin.to_string() });
        }

        let mut combined = self.filter_and_verify(origin, range)?;
        combined.extend(self.filter_and_verify(origin, pending)?);
        combined.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        combined.dedup_by(|a, b| a.hash == b.hash);

        let mut fresh = Vec::with_capacity(combined.len());
        for entry in combined {
            if self.db.store().entry_by_hash(&entry.hash)?.is_none() {
                fresh.push(entry);
            }
        }
        if fresh.is_empty() {
            return Ok(BatchOutcome::Applied(0));
        }

        if self.chain_is_strict() && self.check_continuity(origin, &fresh)?.is_some() {
            warn!(origin, "chain range did not close the gap, snapshot required");
            return Ok(BatchOutcome::SnapshotRequired { node_id: origin.to_string() });
        }

        let applied = self.db.apply_remote_batch(&fresh)?;
        Ok(BatchOutcome::Applied(applied))
    }

    /// Serves a pull request as a sequence of bounded batch responses.
    pub fn serve_batches(
        &self,
        node_id: &str,
        after: &Hlc,
        collections: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<SyncMessage>> {
        let entries = self
            .db
            .store()
            .oplog_for_node_after(node_id, after, collections)?;

        if entries.is_empty() {
            return Ok(vec![SyncMessage::BatchResponse {
                node_id: node_id.to_string(),
                entries: Vec::new(),
                done: true,
            }]);
        }

        let limit = limit.max(1);
        let total = entries.len();
        let mut responses = Vec::new();
        let mut chunks = entries.chunks(limit).peekable();
        while let Some(chunk) = chunks.next() {
            responses.push(SyncMessage::BatchResponse {
                node_id: node_id.to_string(),
                entries: chunk.to_vec(),
                done: chunks.peek().is_none(),
            });
        }
        debug!(node_id, total, batches = responses.len(), "serving batch request");
        Ok(responses)
    }

    /// Serves a chain-range request, signalling `snapshot_required` when
    /// the segment was pruned away.
    pub fn serve_chain_range(
        &self,
        node_id: &str,
        start_hash: &str,
        end_hash: &str,
    ) -> Result<SyncMessage> {
        let range = self.db.store().chain_range(node_id, start_hash, end_hash)?;
        Ok(match range {
            Some(entries) => SyncMessage::ChainRangeResponse {
                node_id: node_id.to_string(),
                entries,
                snapshot_required: false,
            },
            None => SyncMessage::ChainRangeResponse {
                node_id: node_id.to_string(),
                entries: Vec::new(),
                snapshot_required: true,
            },
        })
    }

    /// The collections this node pulls from peers, None meaning all.
    pub fn collection_filter(&self) -> Option<Vec<String>> {
        let interested = &self.db.config().interested_collections;
        if interested.is_empty() {
            None
        } else {
            Some(interested.iter().cloned().collect())
        }
    }

    fn chain_is_strict(&self) -> bool {
        // A collection filter makes the replicated chain sparse.
        self.db.config().interested_collections.is_empty()
    }

    /// Hash-verifies entries, checks their origin, and drops entries for
    /// collections this node does not replicate.
    fn filter_and_verify(&self, origin: &str, entries: &[OplogEntry]) -> Result<Vec<OplogEntry>> {
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.is_valid() {
                return Err(Error::HashMismatch(entry.hash.clone()).into());
            }
            if entry.node_id() != origin {
                return Err(crate::error::NetError::Protocol(format!(
                    "entry from '{}' in a batch claimed from '{origin}'",
                    entry.node_id()
                )));
            }
            if !self.db.config().wants_collection(&entry.collection) {
                warn!(
                    collection = %entry.collection,
                    origin,
                    "dropping entry for collection outside interest set"
                );
                continue;
            }
            kept.push(entry.clone());
        }
        Ok(kept)
    }

    /// Checks that sorted fresh entries attach to the local chain and are
    /// contiguous among themselves.
    ///
    /// Returns the recovery outcome for the first gap found, whether it is
    /// at the front of the batch or in the middle; None when the chain
    /// continues cleanly.
    fn check_continuity(
        &self,
        origin: &str,
        fresh: &[OplogEntry],
    ) -> Result<Option<BatchOutcome>> {
        let store = self.db.store();
        let local_last = store.last_entry_hash(origin)?;
        let boundary = store.snapshot_hash(origin)?;
        let expected = local_last.clone().unwrap_or_default();

        let first = &fresh[0];
        let attaches = first.previous_hash == expected
            || boundary.as_deref() == Some(first.previous_hash.as_str());
        if !attaches {
            let start = local_last.or(boundary).unwrap_or_default();
            debug!(
                origin,
                start,
                end = %first.previous_hash,
                "chain gap detected"
            );
            return Ok(Some(BatchOutcome::NeedRange {
                node_id: origin.to_string(),
                start_hash: start,
                end_hash: first.previous_hash.clone(),
            }));
        }

        for window in fresh.windows(2) {
            if window[1].previous_hash != window[0].hash {
                debug!(
                    origin,
                    start = %window[0].hash,
                    end = %window[1].previous_hash,
                    "chain gap detected inside batch"
                );
                return Ok(Some(BatchOutcome::NeedRange {
                    node_id: origin.to_string(),
                    start_hash: window[0].hash.clone(),
                    end_hash: window[1].previous_hash.clone(),
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
