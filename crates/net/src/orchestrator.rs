// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Per-peer session orchestration.
//!
//! Each known peer (stored configuration plus discovery) gets its own
//! session task driven through a small state machine:
//!
//! `Disconnected → Connecting → Handshaking → Ready → Syncing → Ready`,
//! or `Failed → backoff → Disconnected` on error, with exponential
//! backoff and jitter between attempts.
//!
//! The orchestrator also owns maintenance: pruning the oplog down to the
//! configured retention window on its interval.

use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use entgl_core::{
    snapshot, Hlc, PeerDatabase, PeerType, RemotePeerConfiguration, SystemClock,
};

use crate::engine::SyncEngine;
use crate::error::Result;
use crate::handshake::NodeKeys;
use crate::session::PeerSession;

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshaking,
    Syncing,
    Ready,
    Failed,
}

/// A peer reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub node_id: String,
    pub address: String,
    pub last_seen_ms: i64,
    pub peer_type: PeerType,
}

/// Source of dynamically discovered peers (mDNS, static config, ...).
pub trait DiscoveryService: Send + Sync {
    fn active_peers(&self) -> Vec<DiscoveredPeer>;
}

struct PeerStatus {
    state: PeerState,
    failures: u32,
    not_before: Instant,
    running: bool,
}

impl Default for PeerStatus {
    fn default() -> Self {
        PeerStatus {
            state: PeerState::Disconnected,
            failures: 0,
            not_before: Instant::now(),
            running: false,
        }
    }
}

/// Exponential backoff with jitter, capped at one minute.
fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(6);
    let base_ms = 1000u64 << exponent;
    let jitter = rand::thread_rng().gen_range(0..500);
    Duration::from_millis(base_ms.min(60_000) + jitter)
}

/// Spawns and supervises one session task per peer.
pub struct SyncOrchestrator {
    db: Arc<PeerDatabase>,
    keys: Arc<NodeKeys>,
    discovery: Option<Arc<dyn DiscoveryService>>,
    statuses: Arc<Mutex<HashMap<String, PeerStatus>>>,
}

impl SyncOrchestrator {
    pub fn new(db: Arc<PeerDatabase>, keys: Arc<NodeKeys>) -> Self {
        SyncOrchestrator { db, keys, discovery: None, statuses: Arc::default() }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryService>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn db(&self) -> &Arc<PeerDatabase> {
        &self.db
    }

    /// Snapshot of every known peer's state.
    pub fn peer_states(&self) -> HashMap<String, PeerState> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(node, status)| (node.clone(), status.state))
            .collect()
    }

    /// Ticks sessions and maintenance until shutdown flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = self.db.config().clone();
        let sync_period = Duration::from_millis(config.keepalive_interval_ms.into());
        let maintenance_period =
            Duration::from_secs(u64::from(config.maintenance_interval_minutes) * 60);

        let mut sync_tick = tokio::time::interval(sync_period);
        let mut maintenance_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + maintenance_period,
            maintenance_period,
        );

        loop {
            tokio::select! {
                _ = sync_tick.tick() => self.tick(),
                _ = maintenance_tick.tick() => {
                    if let Err(err) = self.maintain() {
                        warn!(%err, "maintenance failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("orchestrator shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Collects peers from the store and discovery, newest config wins.
    fn gather_peers(&self) -> Vec<RemotePeerConfiguration> {
        let mut peers: HashMap<String, RemotePeerConfiguration> = HashMap::new();

        match self.db.store().remote_peers() {
            Ok(stored) => {
                for peer in stored.into_iter().filter(|p| p.enabled) {
                    peers.insert(peer.node_id.clone(), peer);
                }
            }
            Err(err) => warn!(%err, "could not load stored peers"),
        }

        if let Some(discovery) = &self.discovery {
            for found in discovery.active_peers() {
                peers.entry(found.node_id.clone()).or_insert_with(|| {
                    RemotePeerConfiguration::new(
                        found.node_id.clone(),
                        found.address.clone(),
                        found.peer_type,
                    )
                });
            }
        }

        peers.into_values().collect()
    }

    /// Spawns a session for every peer that is due.
    pub fn tick(self: &Arc<Self>) {
        for peer in self.gather_peers() {
            let due = {
                let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
                let status = statuses.entry(peer.node_id.clone()).or_default();
                if status.running || Instant::now() < status.not_before {
                    false
                } else {
                    if status.state == PeerState::Failed {
                        status.state = PeerState::Disconnected;
                    }
                    status.running = true;
                    true
                }
            };
            if !due {
                continue;
            }

            let orchestrator = self.clone();
            tokio::spawn(async move {
                orchestrator.run_session(peer).await;
            });
        }
    }

    async fn run_session(&self, peer: RemotePeerConfiguration) {
        let node_id = peer.node_id.clone();
        let session =
            PeerSession::new(SyncEngine::new(self.db.clone()), self.keys.clone(), peer);

        let result = async {
            self.set_state(&node_id, PeerState::Connecting);
            let stream = session.dial().await?;
            self.set_state(&node_id, PeerState::Handshaking);
            let mut conn = session.establish(stream).await?;
            // Established and authenticated; Ready until rounds start.
            self.set_state(&node_id, PeerState::Ready);
            self.set_state(&node_id, PeerState::Syncing);
            session.sync(&mut conn).await
        }
        .await;

        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        let status = statuses.entry(node_id.clone()).or_default();
        status.running = false;
        match result {
            Ok(stats) => {
                status.state = PeerState::Ready;
                status.failures = 0;
                debug!(peer = %node_id, pulled = stats.pulled, pushed = stats.pushed, "session ok");
            }
            Err(err) => {
                status.failures += 1;
                status.state = PeerState::Failed;
                status.not_before = Instant::now() + backoff_delay(status.failures);
                warn!(peer = %node_id, failures = status.failures, %err, "session failed");
            }
        }
    }

    fn set_state(&self, node_id: &str, state: PeerState) {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.entry(node_id.to_string()).or_default().state = state;
    }

    /// Prunes the oplog down to the retention window.
    pub fn maintain(&self) -> Result<usize> {
        use entgl_core::ClockSource;

        let config = self.db.config();
        if config.oplog_retention_hours == 0 {
            return Ok(0);
        }
        let cutoff: Hlc =
            snapshot::retention_cutoff(SystemClock.now_ms(), config.oplog_retention_hours);
        let removed = self.db.store().prune_oplog(&cutoff)?;
        if removed > 0 {
            info!(removed, "maintenance pruned oplog entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
