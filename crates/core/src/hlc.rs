// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Hybrid Logical Clock (HLC) for distributed ordering.
//!
//! HLC combines wall clock time with a logical counter to provide causally
//! consistent timestamps even in the presence of clock skew.
//!
//! Canonical format: `{physical_ms}-{logical}-{node_id}`
//!
//! Ordering rules:
//! 1. Higher physical_ms wins
//! 2. If physical_ms equal, higher logical counter wins
//! 3. If both equal, higher node_id wins (deterministic tiebreaker)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// A Hybrid Logical Clock timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hlc {
    /// Wall clock time in milliseconds since Unix epoch.
    pub physical_ms: i64,
    /// Logical counter for ordering events at the same wall time.
    pub logical: i32,
    /// Node identifier for deterministic tiebreaking.
    pub node_id: String,
}

impl Hlc {
    /// Creates a new HLC with the given components.
    pub fn new(physical_ms: i64, logical: i32, node_id: impl Into<String>) -> Self {
        Hlc { physical_ms, logical, node_id: node_id.into() }
    }

    /// Creates an HLC representing the earliest possible time (for queries).
    pub fn zero() -> Self {
        Hlc { physical_ms: 0, logical: 0, node_id: String::new() }
    }

    /// Parses an HLC from its canonical string representation.
    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    /// Returns true if this HLC is strictly greater than the other.
    pub fn is_after(&self, other: &Hlc) -> bool {
        self > other
    }

    /// Returns true if this HLC is strictly less than the other.
    pub fn is_before(&self, other: &Hlc) -> bool {
        self < other
    }

    /// The canonical string form used on the wire and in hash inputs.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.physical_ms
            .cmp(&other.physical_ms)
            .then_with(|| self.logical.cmp(&other.logical))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.physical_ms, self.logical, self.node_id)
    }
}

impl FromStr for Hlc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // The node id may itself contain '-', so split only twice.
        let mut parts = s.splitn(3, '-');
        let (physical, logical, node) = match (parts.next(), parts.next(), parts.next()) {
            (Some(p), Some(l), Some(n)) => (p, l, n),
            _ => {
                return Err(Error::InvalidHlc(format!(
                    "expected format 'physical-logical-node_id', got '{s}'"
                )))
            }
        };

        let physical_ms = physical
            .parse::<i64>()
            .map_err(|_| Error::InvalidHlc(format!("invalid physical_ms '{physical}' in '{s}'")))?;

        let logical = logical
            .parse::<i32>()
            .map_err(|_| Error::InvalidHlc(format!("invalid logical '{logical}' in '{s}'")))?;

        Ok(Hlc::new(physical_ms, logical, node))
    }
}

/// Trait for getting the current wall clock time.
///
/// This allows injecting a mock clock for testing.
pub trait ClockSource: Send + Sync {
    /// Returns the current time in milliseconds since Unix epoch.
    fn now_ms(&self) -> i64;
}

/// System clock implementation using `std::time::SystemTime`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
    }
}

impl<C: ClockSource> ClockSource for &C {
    fn now_ms(&self) -> i64 {
        (*self).now_ms()
    }
}

impl ClockSource for Box<dyn ClockSource> {
    fn now_ms(&self) -> i64 {
        self.as_ref().now_ms()
    }
}

/// A clock generator that produces monotonically increasing HLC timestamps.
///
/// Thread-safe; the internal lock is held only across the tick computation,
/// never across I/O.
pub struct HlcClock<C: ClockSource = SystemClock> {
    clock: C,
    node_id: String,
    // (last physical_ms, last logical)
    last: Mutex<(i64, i32)>,
}

impl HlcClock<SystemClock> {
    /// Creates a new HLC clock with the system clock and given node ID.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::with_clock(SystemClock, node_id)
    }
}

impl<C: ClockSource> HlcClock<C> {
    /// Creates a new HLC clock with a custom clock source.
    pub fn with_clock(clock: C, node_id: impl Into<String>) -> Self {
        HlcClock { clock, node_id: node_id.into(), last: Mutex::new((0, 0)) }
    }

    /// Returns the node ID for this clock.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Generates a new HLC timestamp for a local event.
    ///
    /// Guarantees strictly increasing timestamps even if the wall clock
    /// goes backwards.
    pub fn now(&self) -> Hlc {
        let now = self.clock.now_ms();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let (lp, ll) = *last;

        let (physical, logical) = if now > lp {
            // Normal case: wall clock advanced
            (now, 0)
        } else {
            // Clock went backwards or stayed same: increment counter
            (lp, ll + 1)
        };

        *last = (physical, logical);
        Hlc::new(physical, logical, self.node_id.clone())
    }

    /// Advances the clock based on a received remote timestamp and returns
    /// the new local timestamp.
    ///
    /// This ensures causality: any timestamp generated after receiving a
    /// message is greater than both the received timestamp and everything
    /// generated locally so far.
    pub fn receive(&self, remote: &Hlc) -> Hlc {
        let now = self.clock.now_ms();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let (lp, ll) = *last;

        let physical = lp.max(remote.physical_ms).max(now);
        let logical = if physical == lp && physical == remote.physical_ms {
            ll.max(remote.logical) + 1
        } else if physical == lp {
            ll + 1
        } else if physical == remote.physical_ms {
            remote.logical + 1
        } else {
            0
        };

        *last = (physical, logical);
        Hlc::new(physical, logical, self.node_id.clone())
    }

    /// Returns the last timestamp handed out, without advancing the clock.
    pub fn last_seen(&self) -> Hlc {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        Hlc::new(last.0, last.1, self.node_id.clone())
    }
}

#[cfg(test)]
#[path = "hlc_tests.rs"]
mod tests;
