// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! entgl-core: data model and storage for the EntglDb peer-to-peer
//! document database.
//!
//! This crate provides HLC timestamps and vector clocks, the hash-chained
//! oplog, conflict resolution, the abstract store contract with its SQLite
//! and in-memory backends, snapshots, and the database facade. The wire
//! protocol and sync engine live in entgl-net.

pub mod config;
pub mod coordinator;
pub mod database;
pub mod document;
pub mod error;
pub mod hlc;
pub mod memory;
pub mod oplog;
pub mod query;
pub mod resolver;
pub mod snapshot;
pub mod sqlite;
pub mod store;
pub mod vclock;

pub use config::{
    ConfigurationProvider, NodeConfig, PeerType, RemotePeerConfiguration, StaticConfiguration,
};
pub use coordinator::OplogCoordinator;
pub use database::{Collection, PeerDatabase};
pub use document::{Document, DocumentMetadata};
pub use error::{Error, Result};
pub use hlc::{ClockSource, Hlc, HlcClock, SystemClock};
pub use memory::MemoryStore;
pub use oplog::{OpKind, OplogEntry, SnapshotMetadata};
pub use query::Query;
pub use resolver::{ConflictResolver, LwwResolver, Resolution};
pub use snapshot::Snapshot;
pub use sqlite::SqliteStore;
pub use store::{EventHub, FindOptions, Store, StoreEvent};
pub use vclock::{CausalOrder, VectorClock};
