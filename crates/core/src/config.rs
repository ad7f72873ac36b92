// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Node and peer configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// How a remote peer became known to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    StaticRemote,
    LanDiscovered,
    CloudRemote,
}

impl PeerType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerType::StaticRemote => "static_remote",
            PeerType::LanDiscovered => "lan_discovered",
            PeerType::CloudRemote => "cloud_remote",
        }
    }
}

impl std::fmt::Display for PeerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "static_remote" => Ok(PeerType::StaticRemote),
            "lan_discovered" => Ok(PeerType::LanDiscovered),
            "cloud_remote" => Ok(PeerType::CloudRemote),
            other => Err(Error::InvalidConfig(format!("invalid peer type '{other}'"))),
        }
    }
}

/// A configured remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeerConfiguration {
    pub node_id: String,
    /// `host:port` to dial.
    pub address: String,
    pub peer_type: PeerType,
    /// Token presented to this peer; falls back to the node-wide token.
    pub auth_token: Option<String>,
    pub enabled: bool,
    /// Collections this peer replicates. Empty means all.
    #[serde(default)]
    pub interested_collections: BTreeSet<String>,
}

impl RemotePeerConfiguration {
    pub fn new(
        node_id: impl Into<String>,
        address: impl Into<String>,
        peer_type: PeerType,
    ) -> Self {
        RemotePeerConfiguration {
            node_id: node_id.into(),
            address: address.into(),
            peer_type,
            auth_token: None,
            enabled: true,
            interested_collections: BTreeSet::new(),
        }
    }

    /// True when this peer replicates the given collection.
    pub fn wants_collection(&self, collection: &str) -> bool {
        self.interested_collections.is_empty()
            || self.interested_collections.contains(collection)
    }
}

/// Full configuration of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable identity of this node.
    pub node_id: String,
    /// Shared secret for peer authentication.
    pub auth_token: String,
    /// Listen port; 0 picks an ephemeral port.
    pub tcp_port: u16,
    /// Collections to replicate. Empty means all.
    pub interested_collections: BTreeSet<String>,
    pub oplog_retention_hours: u32,
    pub maintenance_interval_minutes: u32,
    pub max_connections: u32,
    pub max_frame_bytes: u32,
    pub batch_entry_limit: u32,
    pub handshake_timeout_ms: u32,
    pub keepalive_interval_ms: u32,
    pub request_timeout_ms: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: String::new(),
            auth_token: String::new(),
            tcp_port: 0,
            interested_collections: BTreeSet::new(),
            oplog_retention_hours: 24 * 7,
            maintenance_interval_minutes: 60,
            max_connections: 64,
            max_frame_bytes: 16 * 1024 * 1024,
            batch_entry_limit: 500,
            handshake_timeout_ms: 10_000,
            keepalive_interval_ms: 15_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl NodeConfig {
    /// A configuration with the given identity and defaults elsewhere.
    pub fn for_node(node_id: impl Into<String>) -> Self {
        NodeConfig { node_id: node_id.into(), ..Default::default() }
    }

    /// True when this node replicates the given collection.
    pub fn wants_collection(&self, collection: &str) -> bool {
        self.interested_collections.is_empty()
            || self.interested_collections.contains(collection)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id must not be empty".into()));
        }
        if self.max_frame_bytes < 1024 {
            return Err(Error::InvalidConfig("max_frame_bytes must be at least 1 KiB".into()));
        }
        if self.batch_entry_limit == 0 {
            return Err(Error::InvalidConfig("batch_entry_limit must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig("max_connections must be positive".into()));
        }
        Ok(())
    }
}

/// Source of the node configuration.
///
/// Implemented by the host application; the sync layer re-reads it when it
/// wants current settings.
pub trait ConfigurationProvider: Send + Sync {
    fn configuration(&self) -> NodeConfig;
}

/// A provider that always returns the same configuration.
pub struct StaticConfiguration(pub NodeConfig);

impl ConfigurationProvider for StaticConfiguration {
    fn configuration(&self) -> NodeConfig {
        self.0.clone()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
