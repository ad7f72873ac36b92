// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Vector clocks over per-node HLC high-water marks.
//!
//! A [`VectorClock`] maps each known node ID to the latest HLC timestamp
//! observed from that node. Sync planning compares two clocks componentwise:
//! nodes the remote has newer entries for must be pulled, nodes we are ahead
//! on can be pushed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hlc::Hlc;

/// Result of comparing two vector clocks componentwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Every component is equal.
    Equal,
    /// Self has seen everything the other has, and more.
    Dominates,
    /// The other has seen everything self has, and more.
    DominatedBy,
    /// Each side has components the other lacks.
    Concurrent,
}

/// Per-node latest-seen HLC map.
///
/// Missing nodes are treated as timestamp zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    entries: BTreeMap<String, Hlc>,
}

impl VectorClock {
    /// Creates an empty vector clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the timestamp recorded for a node, if any.
    pub fn get(&self, node_id: &str) -> Option<&Hlc> {
        self.entries.get(node_id)
    }

    /// Returns the timestamp for a node, or zero if unknown.
    pub fn get_or_zero(&self, node_id: &str) -> Hlc {
        self.entries.get(node_id).cloned().unwrap_or_else(Hlc::zero)
    }

    /// Records a timestamp, keeping only the maximum per node.
    ///
    /// Returns true if the clock advanced.
    pub fn observe(&mut self, ts: &Hlc) -> bool {
        match self.entries.get(&ts.node_id) {
            Some(existing) if *existing >= *ts => false,
            _ => {
                self.entries.insert(ts.node_id.clone(), ts.clone());
                true
            }
        }
    }

    /// Sets a node's component unconditionally.
    pub fn set(&mut self, node_id: impl Into<String>, ts: Hlc) {
        self.entries.insert(node_id.into(), ts);
    }

    /// Returns the node IDs known to this clock.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates over `(node_id, timestamp)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Hlc)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns true if no node has been observed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of nodes tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Componentwise comparison; missing keys compare as timestamp zero.
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for node in self.entries.keys().chain(other.entries.keys()) {
            let a = self.get_or_zero(node);
            let b = other.get_or_zero(node);
            match a.cmp(&b) {
                std::cmp::Ordering::Greater => self_ahead = true,
                std::cmp::Ordering::Less => other_ahead = true,
                std::cmp::Ordering::Equal => {}
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Dominates,
            (false, true) => CausalOrder::DominatedBy,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// Nodes for which `other` has updates this clock has not seen.
    ///
    /// These are the nodes to pull from a peer advertising `other`.
    pub fn nodes_with_updates_in(&self, other: &VectorClock) -> Vec<String> {
        other
            .entries
            .iter()
            .filter(|(node, ts)| self.get_or_zero(node) < **ts)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Nodes for which this clock is ahead of `other`.
    ///
    /// These are the nodes whose entries can be pushed to a peer
    /// advertising `other`.
    pub fn nodes_to_push_to(&self, other: &VectorClock) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(node, ts)| other.get_or_zero(node) < **ts)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Merges another clock into this one, keeping per-node maxima.
    pub fn merge(&mut self, other: &VectorClock) {
        for ts in other.entries.values() {
            self.observe(ts);
        }
    }
}

#[cfg(test)]
#[path = "vclock_tests.rs"]
mod tests;
