// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use entgl_core::{MemoryStore, NodeConfig, OpKind, OplogEntry, Store};
use serde_json::json;

fn orchestrator_with(config: NodeConfig) -> Arc<SyncOrchestrator> {
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(PeerDatabase::new(store, config).unwrap());
    Arc::new(SyncOrchestrator::new(db, Arc::new(NodeKeys::generate())))
}

struct FixedDiscovery(Vec<DiscoveredPeer>);

impl DiscoveryService for FixedDiscovery {
    fn active_peers(&self) -> Vec<DiscoveredPeer> {
        self.0.clone()
    }
}

#[test]
fn backoff_grows_and_caps() {
    let first = backoff_delay(1);
    assert!(first >= Duration::from_millis(1000));
    assert!(first < Duration::from_millis(1600));

    let third = backoff_delay(3);
    assert!(third >= Duration::from_millis(4000));

    // Far past the cap exponent, the delay stays bounded
    let huge = backoff_delay(40);
    assert!(huge <= Duration::from_millis(64_500));
}

#[tokio::test]
async fn failed_peer_enters_backoff() {
    let mut config = NodeConfig::for_node("local");
    config.auth_token = "t".into();
    config.handshake_timeout_ms = 200;
    let orchestrator = orchestrator_with(config);

    // A peer nobody listens on
    let peer = entgl_core::RemotePeerConfiguration::new(
        "ghost",
        "127.0.0.1:1",
        PeerType::StaticRemote,
    );
    orchestrator.db().store().save_remote_peer(&peer).unwrap();

    orchestrator.tick();
    // Wait for the dial to fail
    tokio::time::sleep(Duration::from_millis(600)).await;

    let states = orchestrator.peer_states();
    assert_eq!(states.get("ghost"), Some(&PeerState::Failed));

    // A second tick inside the backoff window must not flip it back
    orchestrator.tick();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orchestrator.peer_states().get("ghost"), Some(&PeerState::Failed));
}

#[tokio::test]
async fn disabled_peers_are_ignored() {
    let mut config = NodeConfig::for_node("local");
    config.handshake_timeout_ms = 200;
    let orchestrator = orchestrator_with(config);

    let mut peer = entgl_core::RemotePeerConfiguration::new(
        "off",
        "127.0.0.1:1",
        PeerType::StaticRemote,
    );
    peer.enabled = false;
    orchestrator.db().store().save_remote_peer(&peer).unwrap();

    orchestrator.tick();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(orchestrator.peer_states().is_empty());
}

#[tokio::test]
async fn discovery_contributes_peers() {
    let mut config = NodeConfig::for_node("local");
    config.handshake_timeout_ms = 200;
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(PeerDatabase::new(store, config).unwrap());
    let discovery = Arc::new(FixedDiscovery(vec![DiscoveredPeer {
        node_id: "lan-1".into(),
        address: "127.0.0.1:1".into(),
        last_seen_ms: 0,
        peer_type: PeerType::LanDiscovered,
    }]));
    let orchestrator = Arc::new(
        SyncOrchestrator::new(db, Arc::new(NodeKeys::generate())).with_discovery(discovery),
    );

    orchestrator.tick();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(orchestrator.peer_states().contains_key("lan-1"));
}

#[tokio::test]
async fn successful_session_passes_through_ready() {
    let server = crate::server::tests::TestNode::start("server", "t0k3n").await;
    server.db.put("users", "u1", json!({"v": 1})).unwrap();

    let mut config = NodeConfig::for_node("local");
    config.auth_token = "t0k3n".into();
    let orchestrator = orchestrator_with(config);

    let peer = entgl_core::RemotePeerConfiguration::new(
        "server",
        server.addr.to_string(),
        PeerType::StaticRemote,
    );
    orchestrator.db().store().save_remote_peer(&peer).unwrap();

    orchestrator.tick();

    // The session walks Connecting → Handshaking → Ready → Syncing and
    // lands back on Ready once the rounds converge.
    let mut ready = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if orchestrator.peer_states().get("server") == Some(&PeerState::Ready) {
            ready = true;
            break;
        }
    }
    assert!(ready, "peer never reached Ready");
    assert!(orchestrator.db().get("users", "u1").unwrap().is_some());

    server.shutdown();
}

#[test]
fn maintenance_prunes_to_retention_window() {
    let mut config = NodeConfig::for_node("local");
    config.oplog_retention_hours = 1;
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(PeerDatabase::new(store, config).unwrap());

    // Two ancient entries and one current
    let old1 = OplogEntry::new("c", "k1", OpKind::Put, Some(json!(1)), Hlc::new(1000, 0, "a"), "");
    let old2 =
        OplogEntry::new("c", "k2", OpKind::Put, Some(json!(2)), Hlc::new(2000, 0, "a"), &old1.hash);
    db.apply_remote_batch(&[old1, old2.clone()]).unwrap();
    db.put("c", "k3", json!(3)).unwrap();

    let orchestrator =
        Arc::new(SyncOrchestrator::new(db.clone(), Arc::new(NodeKeys::generate())));
    let removed = orchestrator.maintain().unwrap();
    assert_eq!(removed, 2);

    // The boundary lets the pruned node's chain still attach
    let meta = db.store().snapshot_metadata("a").unwrap().unwrap();
    assert_eq!(meta.hash, old2.hash);
}

#[test]
fn zero_retention_disables_pruning() {
    let mut config = NodeConfig::for_node("local");
    config.oplog_retention_hours = 0;
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(PeerDatabase::new(store, config).unwrap());
    db.put("c", "k", json!(1)).unwrap();

    let orchestrator = Arc::new(SyncOrchestrator::new(db, Arc::new(NodeKeys::generate())));
    assert_eq!(orchestrator.maintain().unwrap(), 0);
}
