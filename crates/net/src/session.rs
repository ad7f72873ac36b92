// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound peer sessions.
//!
//! A session dials a peer, completes the handshake and authentication,
//! then runs rounds of vector-clock exchange, pulling and pushing oplog
//! batches until both plans are empty. Chain gaps trigger one chain-range
//! round trip; an unclosable gap falls back to a full snapshot pull,
//! buffered to a temp file and merged (never replacing local state).
//!
//! While waiting for a response the session also services requests the
//! peer interleaves on the same connection (pings, chain ranges for our
//! pushes, snapshot pulls), so neither side ever blocks the other.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use entgl_core::{snapshot, Hlc, RemotePeerConfiguration};

use crate::engine::{plan, BatchOutcome, SyncEngine};
use crate::error::{NetError, Result};
use crate::frame::{write_frame, MsgType};
use crate::handshake::{initiate, CipherState, NodeKeys};
use crate::protocol::{read_inbound, write_message, Inbound, SyncMessage, SNAPSHOT_CHUNK_BYTES};

/// Upper bound on VC-exchange rounds per session.
const MAX_SYNC_ROUNDS: u32 = 8;

/// What one session accomplished.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub rounds: u32,
    pub pulled: usize,
    pub pushed: usize,
    pub snapshot_fallback: bool,
}

/// An established, encrypted connection.
pub struct Connection<S> {
    stream: S,
    cipher: CipherState,
    max_frame: usize,
    request_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(
        stream: S,
        cipher: CipherState,
        max_frame: usize,
        request_timeout: Duration,
    ) -> Self {
        Connection { stream, cipher, max_frame, request_timeout }
    }

    pub async fn send(&mut self, message: &SyncMessage) -> Result<()> {
        write_message(&mut self.stream, &mut self.cipher, message, self.max_frame).await
    }

    pub async fn send_chunk(&mut self, data: &[u8]) -> Result<()> {
        write_frame(
            &mut self.stream,
            Some(&mut self.cipher),
            MsgType::SnapshotChunk,
            data,
            self.max_frame,
        )
        .await
    }

    /// Reads the next inbound frame, bounded by the request timeout.
    pub async fn recv(&mut self) -> Result<Inbound> {
        timeout(
            self.request_timeout,
            read_inbound(&mut self.stream, &mut self.cipher, self.max_frame),
        )
        .await
        .map_err(|_| NetError::Timeout("peer response"))?
    }

    /// Reads with a caller-chosen deadline (used for idle waits).
    pub async fn recv_deadline(&mut self, deadline: Duration) -> Result<Inbound> {
        timeout(
            deadline,
            read_inbound(&mut self.stream, &mut self.cipher, self.max_frame),
        )
        .await
        .map_err(|_| NetError::Timeout("peer activity"))?
    }

    /// Streams a snapshot as bounded chunks with an empty terminator.
    pub async fn send_snapshot(&mut self, snapshot: &snapshot::Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        for chunk in bytes.chunks(SNAPSHOT_CHUNK_BYTES) {
            self.send_chunk(chunk).await?;
        }
        self.send_chunk(&[]).await?;
        debug!(bytes = bytes.len(), "snapshot streamed");
        Ok(())
    }
}

/// Handles a request the peer interleaved into our receive window.
///
/// Returns the message back when it was not a serviceable request.
pub async fn service_request<S: AsyncRead + AsyncWrite + Unpin>(
    engine: &SyncEngine,
    conn: &mut Connection<S>,
    message: SyncMessage,
) -> Result<Option<SyncMessage>> {
    match message {
        SyncMessage::Ping { id } => {
            conn.send(&SyncMessage::Ping { id }).await?;
            Ok(None)
        }
        SyncMessage::ChainRangeRequest { node_id, start_hash, end_hash } => {
            let response = engine.serve_chain_range(&node_id, &start_hash, &end_hash)?;
            conn.send(&response).await?;
            Ok(None)
        }
        SyncMessage::SnapshotRequest => {
            let snapshot =
                snapshot::export(engine.db().store().as_ref(), engine.db().node_id())?;
            conn.send_snapshot(&snapshot).await?;
            Ok(None)
        }
        other => Ok(Some(other)),
    }
}

/// Receives the next structured message, servicing interleaved requests.
pub async fn recv_message<S: AsyncRead + AsyncWrite + Unpin>(
    engine: &SyncEngine,
    conn: &mut Connection<S>,
) -> Result<SyncMessage> {
    loop {
        match conn.recv().await? {
            Inbound::Message(SyncMessage::Close { reason }) => {
                return Err(NetError::PeerClosed(reason));
            }
            Inbound::Message(message) => {
                if let Some(message) = service_request(engine, conn, message).await? {
                    return Ok(message);
                }
            }
            Inbound::SnapshotChunk(_) => {
                return Err(NetError::Protocol("unexpected snapshot chunk".into()));
            }
        }
    }
}

/// Receives a full snapshot stream into a temp file and parses it.
pub async fn recv_snapshot<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut Connection<S>,
) -> Result<snapshot::Snapshot> {
    use std::io::{Seek, Write};

    let mut file = tempfile::tempfile()?;
    loop {
        match conn.recv().await? {
            Inbound::SnapshotChunk(chunk) if chunk.is_empty() => break,
            Inbound::SnapshotChunk(chunk) => file.write_all(&chunk)?,
            Inbound::Message(SyncMessage::Close { reason }) => {
                return Err(NetError::PeerClosed(reason));
            }
            Inbound::Message(_) => {
                return Err(NetError::Protocol("expected snapshot chunk".into()));
            }
        }
    }
    file.seek(std::io::SeekFrom::Start(0))?;
    Ok(snapshot::read_from(std::io::BufReader::new(file))?)
}

/// A dialing session to one configured peer.
pub struct PeerSession {
    engine: SyncEngine,
    keys: std::sync::Arc<NodeKeys>,
    peer: RemotePeerConfiguration,
}

impl PeerSession {
    pub fn new(
        engine: SyncEngine,
        keys: std::sync::Arc<NodeKeys>,
        peer: RemotePeerConfiguration,
    ) -> Self {
        PeerSession { engine, keys, peer }
    }

    /// Dials the peer and runs one sync session to convergence.
    pub async fn run_once(&self) -> Result<SyncStats> {
        let stream = self.dial().await?;
        let mut conn = self.establish(stream).await?;
        self.sync(&mut conn).await
    }

    /// Opens the TCP connection under the handshake deadline.
    pub async fn dial(&self) -> Result<TcpStream> {
        let config = self.engine.db().config();
        let handshake_timeout = Duration::from_millis(config.handshake_timeout_ms.into());
        Ok(timeout(handshake_timeout, TcpStream::connect(&self.peer.address))
            .await
            .map_err(|_| NetError::Timeout("connect"))??)
    }

    /// Runs the handshake and authenticates.
    pub async fn establish(&self, mut stream: TcpStream) -> Result<Connection<TcpStream>> {
        let config = self.engine.db().config().clone();
        let handshake_timeout = Duration::from_millis(config.handshake_timeout_ms.into());
        let request_timeout = Duration::from_millis(config.request_timeout_ms.into());
        let max_frame = config.max_frame_bytes as usize;

        let cipher = timeout(handshake_timeout, initiate(&mut stream, &self.keys, max_frame))
            .await
            .map_err(|_| NetError::Timeout("handshake"))??;
        let mut conn = Connection::new(stream, cipher, max_frame, request_timeout);

        // Authenticate; a server that rejects us closes without a reply.
        let token = self
            .peer
            .auth_token
            .clone()
            .unwrap_or_else(|| config.auth_token.clone());
        conn.send(&SyncMessage::Hello { node_id: config.node_id.clone(), auth_token: token })
            .await?;
        match recv_message(&self.engine, &mut conn).await {
            Ok(SyncMessage::HelloAck { node_id }) => {
                if node_id != self.peer.node_id && !self.peer.node_id.is_empty() {
                    warn!(
                        expected = %self.peer.node_id,
                        actual = %node_id,
                        "peer identity differs from configuration"
                    );
                }
            }
            Ok(other) => {
                return Err(NetError::Protocol(format!("expected hello ack, got {other:?}")))
            }
            Err(NetError::Io(_)) | Err(NetError::PeerClosed(_)) => {
                return Err(NetError::AuthFailed)
            }
            Err(err) => return Err(err),
        }
        Ok(conn)
    }

    /// Runs VC-exchange rounds until both sides converge.
    pub async fn sync(&self, conn: &mut Connection<TcpStream>) -> Result<SyncStats> {
        let config = self.engine.db().config().clone();
        let mut stats = SyncStats::default();
        while stats.rounds < MAX_SYNC_ROUNDS {
            stats.rounds += 1;

            let local_vc = self.engine.db().vector_clock()?;
            conn.send(&SyncMessage::VectorClock { clock: local_vc.clone() }).await?;
            let remote_vc = match recv_message(&self.engine, conn).await? {
                SyncMessage::VectorClock { clock } => clock,
                other => {
                    return Err(NetError::Protocol(format!(
                        "expected vector clock, got {other:?}"
                    )))
                }
            };

            let plan = plan(&local_vc, &remote_vc);
            if plan.is_converged() {
                break;
            }
            debug!(
                peer = %self.peer.node_id,
                pull = plan.pull.len(),
                push = plan.push.len(),
                round = stats.rounds,
                "sync round planned"
            );

            let mut fell_back = false;
            for (node, since) in &plan.pull {
                match self.pull_node(conn, node, since, &config).await? {
                    PullResult::Applied(count) => stats.pulled += count,
                    PullResult::SnapshotFallback => {
                        self.snapshot_fallback(conn).await?;
                        stats.snapshot_fallback = true;
                        fell_back = true;
                        break;
                    }
                }
            }
            if fell_back {
                // Fresh VC exchange next round; incremental sync resumes.
                continue;
            }

            for (node, since) in &plan.push {
                stats.pushed += self.push_node(conn, node, since, &config).await?;
            }
        }

        let _ = conn.send(&SyncMessage::Close { reason: "converged".into() }).await;
        info!(
            peer = %self.peer.node_id,
            rounds = stats.rounds,
            pulled = stats.pulled,
            pushed = stats.pushed,
            "session finished"
        );
        Ok(stats)
    }

    async fn pull_node(
        &self,
        conn: &mut Connection<TcpStream>,
        node: &str,
        since: &Hlc,
        config: &entgl_core::NodeConfig,
    ) -> Result<PullResult> {
        conn.send(&SyncMessage::BatchRequest {
            node_id: node.to_string(),
            after: since.clone(),
            collections: self.engine.collection_filter(),
            limit: config.batch_entry_limit,
        })
        .await?;

        let mut applied_total = 0;
        loop {
            let (entries, done) = match recv_message(&self.engine, conn).await? {
                SyncMessage::BatchResponse { node_id, entries, done } if node_id == node => {
                    (entries, done)
                }
                other => {
                    return Err(NetError::Protocol(format!(
                        "expected batch response for '{node}', got {other:?}"
                    )))
                }
            };

            match self.engine.process_inbound_batch(node, &entries)? {
                BatchOutcome::Applied(count) => applied_total += count,
                BatchOutcome::NeedRange { node_id, start_hash, end_hash } => {
                    match self
                        .recover_gap(conn, &node_id, &start_hash, &end_hash, &entries)
                        .await?
                    {
                        BatchOutcome::Applied(count) => applied_total += count,
                        _ => return Ok(PullResult::SnapshotFallback),
                    }
                }
                BatchOutcome::SnapshotRequired { .. } => {
                    return Ok(PullResult::SnapshotFallback);
                }
            }

            if done {
                break;
            }
        }
        Ok(PullResult::Applied(applied_total))
    }

    /// One chain-range round trip; anything short of success escalates.
    async fn recover_gap(
        &self,
        conn: &mut Connection<TcpStream>,
        node: &str,
        start_hash: &str,
        end_hash: &str,
        pending: &[entgl_core::OplogEntry],
    ) -> Result<BatchOutcome> {
        conn.send(&SyncMessage::ChainRangeRequest {
            node_id: node.to_string(),
            start_hash: start_hash.to_string(),
            end_hash: end_hash.to_string(),
        })
        .await?;

        let (entries, snapshot_required) = match recv_message(&self.engine, conn).await? {
            SyncMessage::ChainRangeResponse { node_id, entries, snapshot_required }
                if node_id == node =>
            {
                (entries, snapshot_required)
            }
            other => {
                return Err(NetError::Protocol(format!(
                    "expected chain range response, got {other:?}"
                )))
            }
        };

        if snapshot_required {
            return Ok(BatchOutcome::SnapshotRequired { node_id: node.to_string() });
        }
        self.engine.apply_with_range(node, &entries, pending)
    }

    async fn push_node(
        &self,
        conn: &mut Connection<TcpStream>,
        node: &str,
        since: &Hlc,
        config: &entgl_core::NodeConfig,
    ) -> Result<usize> {
        // Restrict pushes to what the peer declared interest in.
        let filter: Option<Vec<String>> = if self.peer.interested_collections.is_empty() {
            None
        } else {
            Some(self.peer.interested_collections.iter().cloned().collect())
        };

        let entries = self
            .engine
            .db()
            .store()
            .oplog_for_node_after(node, since, filter.as_deref())?;
        if entries.is_empty() {
            return Ok(0);
        }

        let total = entries.len();
        let limit = (config.batch_entry_limit as usize).max(1);
        let mut chunks = entries.chunks(limit).peekable();
        while let Some(chunk) = chunks.next() {
            conn.send(&SyncMessage::BatchResponse {
                node_id: node.to_string(),
                entries: chunk.to_vec(),
                done: chunks.peek().is_none(),
            })
            .await?;
        }
        Ok(total)
    }

    /// Pulls and merges the peer's full snapshot exactly once.
    async fn snapshot_fallback(&self, conn: &mut Connection<TcpStream>) -> Result<()> {
        warn!(peer = %self.peer.node_id, "falling back to full snapshot");
        conn.send(&SyncMessage::SnapshotRequest).await?;
        let snapshot = recv_snapshot(conn).await?;
        snapshot::merge(self.engine.db().store().as_ref(), &snapshot)?;
        Ok(())
    }
}

enum PullResult {
    Applied(usize),
    SnapshotFallback,
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
