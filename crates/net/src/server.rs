// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The sync server.
//!
//! Accepts TCP connections, enforces the connection cap (overflow sockets
//! are closed without a single byte), runs the responder handshake under
//! its timeout, authenticates the hello, then serves the peer's requests:
//! vector clocks, batch pulls split at the configured limit, chain
//! ranges, snapshots, and inbound pushes with the same single-round gap
//! recovery a puller gets.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use entgl_core::{snapshot, OplogEntry, PeerDatabase};

use crate::auth::Authenticator;
use crate::engine::{BatchOutcome, SyncEngine};
use crate::error::{NetError, Result};
use crate::handshake::{respond, NodeKeys};
use crate::protocol::{Inbound, SyncMessage};
use crate::session::Connection;

/// Per-connection dispatch state for inbound pushes.
#[derive(Default)]
struct PushRecovery {
    /// A pushed batch parked while its chain range is in flight.
    pending: Option<(String, Vec<OplogEntry>)>,
    /// Chunks of a snapshot the pushing side is streaming to us.
    snapshot: Option<tempfile::SpooledTempFile>,
}

/// Accepts and serves peer connections.
pub struct SyncServer {
    db: Arc<PeerDatabase>,
    authenticator: Arc<dyn Authenticator>,
    keys: Arc<NodeKeys>,
    connections: Arc<AtomicUsize>,
}

impl SyncServer {
    pub fn new(
        db: Arc<PeerDatabase>,
        authenticator: Arc<dyn Authenticator>,
        keys: Arc<NodeKeys>,
    ) -> Self {
        SyncServer { db, authenticator, keys, connections: Arc::new(AtomicUsize::new(0)) }
    }

    /// Binds the configured port (0 picks an ephemeral one).
    pub async fn bind(&self) -> Result<TcpListener> {
        let port = self.db.config().tcp_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(addr = %listener.local_addr()?, "sync server listening");
        Ok(listener)
    }

    /// Accept loop; returns when the shutdown signal flips.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let server = self.clone();

                    let max = server.db.config().max_connections as usize;
                    let active = server.connections.load(Ordering::SeqCst);
                    if active >= max {
                        // Admission control: close without sending anything.
                        warn!(%peer_addr, active, max, "connection limit reached, dropping");
                        drop(stream);
                        continue;
                    }
                    server.connections.fetch_add(1, Ordering::SeqCst);

                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(stream).await {
                            debug!(%peer_addr, %err, "connection ended with error");
                        }
                        server.connections.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("sync server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Number of live connections, for tests and health checks.
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let config = self.db.config().clone();
        let max_frame = config.max_frame_bytes as usize;
        let handshake_timeout = Duration::from_millis(config.handshake_timeout_ms.into());
        let request_timeout = Duration::from_millis(config.request_timeout_ms.into());
        let idle_timeout =
            Duration::from_millis(u64::from(config.keepalive_interval_ms) * 3);

        let cipher = timeout(handshake_timeout, respond(&mut stream, &self.keys, max_frame))
            .await
            .map_err(|_| NetError::Timeout("handshake"))??;
        let mut conn = Connection::new(stream, cipher, max_frame, request_timeout);

        // First message must authenticate; anything else drops the socket.
        let peer_node = match timeout(handshake_timeout, conn.recv())
            .await
            .map_err(|_| NetError::Timeout("hello"))??
        {
            Inbound::Message(SyncMessage::Hello { node_id, auth_token }) => {
                if !self.authenticator.validate(&node_id, &auth_token) {
                    warn!(node_id, "authentication failed");
                    return Err(NetError::AuthFailed);
                }
                node_id
            }
            _ => return Err(NetError::Protocol("expected hello".into())),
        };
        conn.send(&SyncMessage::HelloAck { node_id: config.node_id.clone() })
            .await?;
        info!(peer = %peer_node, "peer session established");

        let engine = SyncEngine::new(self.db.clone());
        let mut recovery = PushRecovery::default();

        loop {
            let inbound = match conn.recv_deadline(idle_timeout).await {
                Ok(inbound) => inbound,
                Err(NetError::Timeout(_)) => {
                    debug!(peer = %peer_node, "idle timeout, closing");
                    return Ok(());
                }
                Err(NetError::Io(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            match inbound {
                Inbound::Message(message) => {
                    if !self
                        .dispatch(&engine, &mut conn, &mut recovery, &peer_node, message)
                        .await?
                    {
                        return Ok(());
                    }
                }
                Inbound::SnapshotChunk(chunk) => {
                    self.take_snapshot_chunk(&engine, &mut recovery, &peer_node, chunk)?;
                }
            }
        }
    }

    /// Handles one message; returns false to close the session cleanly.
    async fn dispatch(
        &self,
        engine: &SyncEngine,
        conn: &mut Connection<TcpStream>,
        recovery: &mut PushRecovery,
        peer_node: &str,
        message: SyncMessage,
    ) -> Result<bool> {
        let config = self.db.config();
        match message {
            SyncMessage::VectorClock { clock: _ } => {
                let clock = self.db.vector_clock()?;
                conn.send(&SyncMessage::VectorClock { clock }).await?;
            }

            SyncMessage::BatchRequest { node_id, after, collections, limit } => {
                let limit = (limit.min(config.batch_entry_limit) as usize).max(1);
                let responses =
                    engine.serve_batches(&node_id, &after, collections.as_deref(), limit)?;
                for response in responses {
                    conn.send(&response).await?;
                }
            }

            // An unsolicited batch response is the peer pushing.
            SyncMessage::BatchResponse { node_id, entries, done: _ } => {
                match engine.process_inbound_batch(&node_id, &entries)? {
                    BatchOutcome::Applied(count) => {
                        debug!(peer = %peer_node, origin = %node_id, count, "push applied");
                    }
                    BatchOutcome::NeedRange { node_id, start_hash, end_hash } => {
                        recovery.pending = Some((node_id.clone(), entries));
                        conn.send(&SyncMessage::ChainRangeRequest {
                            node_id,
                            start_hash,
                            end_hash,
                        })
                        .await?;
                    }
                    BatchOutcome::SnapshotRequired { node_id } => {
                        warn!(origin = %node_id, "pushed batch needs snapshot");
                        conn.send(&SyncMessage::SnapshotRequest).await?;
                    }
                }
            }

            SyncMessage::ChainRangeRequest { node_id, start_hash, end_hash } => {
                let response = engine.serve_chain_range(&node_id, &start_hash, &end_hash)?;
                conn.send(&response).await?;
            }

            // Answer to a chain-range request we issued for a parked push.
            SyncMessage::ChainRangeResponse { node_id, entries, snapshot_required } => {
                let Some((pending_node, pending)) = recovery.pending.take() else {
                    return Err(NetError::Protocol("unsolicited chain range response".into()));
                };
                if pending_node != node_id {
                    return Err(NetError::Protocol("chain range response for wrong node".into()));
                }
                let outcome = if snapshot_required {
                    BatchOutcome::SnapshotRequired { node_id: node_id.clone() }
                } else {
                    engine.apply_with_range(&node_id, &entries, &pending)?
                };
                match outcome {
                    BatchOutcome::Applied(count) => {
                        debug!(origin = %node_id, count, "push gap recovered");
                    }
                    _ => {
                        conn.send(&SyncMessage::SnapshotRequest).await?;
                    }
                }
            }

            SyncMessage::SnapshotRequest => {
                let snapshot = snapshot::export(self.db.store().as_ref(), self.db.node_id())?;
                conn.send_snapshot(&snapshot).await?;
            }

            SyncMessage::Ping { id } => {
                conn.send(&SyncMessage::Ping { id }).await?;
            }

            SyncMessage::Close { reason } => {
                debug!(peer = %peer_node, reason, "peer closed session");
                return Ok(false);
            }

            SyncMessage::Hello { .. } | SyncMessage::HelloAck { .. } => {
                return Err(NetError::Protocol("unexpected handshake message".into()));
            }
        }
        Ok(true)
    }

    /// Accumulates a pushed snapshot; the empty chunk finalizes the merge.
    fn take_snapshot_chunk(
        &self,
        engine: &SyncEngine,
        recovery: &mut PushRecovery,
        peer_node: &str,
        chunk: Vec<u8>,
    ) -> Result<()> {
        if !chunk.is_empty() {
            let file = recovery
                .snapshot
                .get_or_insert_with(|| tempfile::spooled_tempfile(16 * 1024 * 1024));
            file.write_all(&chunk)?;
            return Ok(());
        }

        let Some(mut file) = recovery.snapshot.take() else {
            return Err(NetError::Protocol("empty snapshot stream".into()));
        };
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0))?;
        let snapshot = snapshot::read_from(std::io::BufReader::new(file))?;
        let stats = snapshot::merge(engine.db().store().as_ref(), &snapshot)?;
        info!(
            peer = %peer_node,
            entries = stats.entries_added,
            documents = stats.documents_applied,
            "merged pushed snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
pub(crate) mod tests;
