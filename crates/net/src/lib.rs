// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! entgl-net: wire protocol and sync engine for the EntglDb peer-to-peer
//! document database.
//!
//! Frames are length-prefixed, optionally zlib-compressed and
//! ChaCha20-Poly1305 encrypted under keys agreed via an X25519 handshake.
//! On top of that, peers exchange vector clocks, pull and push per-node
//! oplog batches, recover chain gaps, and fall back to full snapshots.

pub mod auth;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod orchestrator;
pub mod protocol;
pub mod server;
pub mod session;

pub use auth::{Authenticator, TokenAuthenticator};
pub use engine::{plan, BatchOutcome, SyncEngine, SyncPlan};
pub use error::{NetError, Result};
pub use frame::{MsgType, DEFAULT_MAX_FRAME_BYTES};
pub use handshake::{CipherState, NodeKeys};
pub use orchestrator::{DiscoveredPeer, DiscoveryService, PeerState, SyncOrchestrator};
pub use protocol::{Inbound, SyncMessage, SNAPSHOT_CHUNK_BYTES};
pub use server::SyncServer;
pub use session::{PeerSession, SyncStats};
