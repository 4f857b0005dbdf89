//! One-shot cleanup without a tunnel server identity

use std::sync::Arc;

use dv_core::clock::ManualClock;
use dv_core::crypto::TunnelKeyPair;
use dv_core::ledger::memory::MemoryLedger;
use dv_core::tunnel::MemoryTunnel;
use dv_core::{AuthorizeRequest, DvpnConfig, DvpnError};
use dv_daemon::{cleanup_reaper, Collaborators, DaemonServer};

fn parts(tunnel: Arc<MemoryTunnel>) -> Collaborators {
    Collaborators {
        ledger: Arc::new(MemoryLedger::new()),
        tunnel,
        clock: Arc::new(ManualClock::new(1_700_000_000)),
    }
}

#[tokio::test]
async fn test_cleanup_runs_without_server_peer() {
    let dir = tempfile::tempdir().unwrap();
    let tunnel = Arc::new(MemoryTunnel::new());
    let orphan = TunnelKeyPair::generate().public_key();
    tunnel.insert_peer(orphan, "10.10.0.77".parse().unwrap());
    let config = DvpnConfig::default().with_state_dir(dir.path()).with_gossip(false);

    // The full daemon cannot start without knowing its own tunnel peer
    assert!(DaemonServer::new(config.clone(), parts(tunnel.clone())).await.is_err());

    let reaper = cleanup_reaper(&config, &parts(tunnel.clone())).unwrap();
    let report = reaper.sweep(false).await;
    assert_eq!(report.orphans_removed, vec![orphan]);
    assert!(!tunnel.contains(&orphan));
}

#[tokio::test]
async fn test_cleanup_reaper_refuses_to_grant() {
    let dir = tempfile::tempdir().unwrap();
    let config = DvpnConfig::default().with_state_dir(dir.path());
    let reaper = cleanup_reaper(&config, &parts(Arc::new(MemoryTunnel::new()))).unwrap();

    let request = AuthorizeRequest {
        session_id: dv_core::Pubkey::new([1; 32]).to_string(),
        client_tunnel_key: TunnelKeyPair::generate().public_key().to_base64(),
        signature: bs58::encode([0u8; 64]).into_string(),
    };
    assert!(matches!(reaper.authorizer().authorize(&request).await, Err(DvpnError::Config(_))));
}
