// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared harness: full in-process nodes on random ports.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use entgl_core::{
    MemoryStore, NodeConfig, PeerDatabase, PeerType, RemotePeerConfiguration, SqliteStore, Store,
};
use entgl_net::{NodeKeys, PeerSession, SyncEngine, SyncServer, TokenAuthenticator};

/// One complete node: store, database facade, listening sync server.
pub struct Node {
    pub db: Arc<PeerDatabase>,
    pub addr: SocketAddr,
    pub keys: Arc<NodeKeys>,
    shutdown_tx: watch::Sender<bool>,
    _dir: Option<tempfile::TempDir>,
}

impl Node {
    /// Starts a node over an in-memory store.
    pub async fn start(node_id: &str, token: &str) -> Self {
        Self::start_inner(node_id, token, false, |_| {}).await
    }

    /// Starts a node over an in-memory store with config tweaks.
    pub async fn start_with(
        node_id: &str,
        token: &str,
        tweak: impl FnOnce(&mut NodeConfig),
    ) -> Self {
        Self::start_inner(node_id, token, false, tweak).await
    }

    /// Starts a node persisted to a SQLite file in a temp directory.
    pub async fn start_sqlite(node_id: &str, token: &str) -> Self {
        Self::start_inner(node_id, token, true, |_| {}).await
    }

    async fn start_inner(
        node_id: &str,
        token: &str,
        sqlite: bool,
        tweak: impl FnOnce(&mut NodeConfig),
    ) -> Self {
        let mut config = NodeConfig::for_node(node_id);
        config.auth_token = token.to_string();
        config.handshake_timeout_ms = 2_000;
        config.request_timeout_ms = 5_000;
        config.keepalive_interval_ms = 1_000;
        tweak(&mut config);

        let (store, dir): (Arc<dyn Store>, Option<tempfile::TempDir>) = if sqlite {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteStore::open(dir.path().join("entgl.db")).unwrap();
            (Arc::new(store), Some(dir))
        } else {
            (Arc::new(MemoryStore::new()), None)
        };

        let db = Arc::new(PeerDatabase::new(store, config).unwrap());
        let keys = Arc::new(NodeKeys::generate());
        let authenticator = Arc::new(TokenAuthenticator::new(token));
        let server = Arc::new(SyncServer::new(db.clone(), authenticator, keys.clone()));

        let listener = server.bind().await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = server.run(listener, shutdown_rx).await;
        });

        Node { db, addr, keys, shutdown_tx, _dir: dir }
    }

    /// A dialing session from this node to another.
    pub fn session_to(&self, other: &Node) -> PeerSession {
        let peer = RemotePeerConfiguration::new(
            other.db.node_id(),
            other.addr.to_string(),
            PeerType::StaticRemote,
        );
        PeerSession::new(SyncEngine::new(self.db.clone()), self.keys.clone(), peer)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
