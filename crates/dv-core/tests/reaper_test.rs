//! Expiry reaper passes over real lease files

mod common;

use common::{owner, request, session, Harness, NOW};
use dv_core::authorizer::LeaseState;
use dv_core::crypto::TunnelKeyPair;
use dv_core::ledger::SessionState;

#[tokio::test]
async fn test_expired_lease_is_reaped_in_one_pass() {
    let mut h = Harness::new();
    let alice = owner();
    let s = h.open_session(&alice, NOW + 60, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    h.authorizer.authorize(&request(&alice, &s, &key)).await.unwrap();

    h.clock.advance(61);
    let report = h.reaper.sweep(false).await;

    assert_eq!(report.revoked, vec![s]);
    assert!(!h.tunnel.contains(&key));
    assert!(h.authorizer.leases().is_empty());
    assert_eq!(h.authorizer.state(&s), LeaseState::Revoked);
    let on_disk = std::fs::read_to_string(h.leases_path()).unwrap();
    assert!(!on_disk.contains(&s.to_string()));
}

#[tokio::test]
async fn test_live_session_survives_sweep() {
    let mut h = Harness::new();
    let alice = owner();
    let s = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    h.authorizer.authorize(&request(&alice, &s, &key)).await.unwrap();

    let report = h.reaper.sweep(false).await;
    assert!(report.revoked.is_empty());
    assert_eq!(report.examined, 1);
    assert!(h.tunnel.contains(&key));
}

#[tokio::test]
async fn test_closed_session_is_reaped_before_end() {
    let mut h = Harness::new();
    let alice = owner();
    let s = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    h.authorizer.authorize(&request(&alice, &s, &key)).await.unwrap();

    let mut closed = session(dv_core::crypto::owner_pubkey(&alice), NOW + 3600, 1_000_000);
    closed.state = SessionState::Closed;
    h.put_session(s, closed);

    assert_eq!(h.reaper.sweep(false).await.revoked, vec![s]);
}

#[tokio::test]
async fn scenario_5_dry_run_leaves_lease_file_unchanged() {
    let mut h = Harness::new();
    let alice = owner();
    let s = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    h.authorizer.authorize(&request(&alice, &s, &key)).await.unwrap();
    let before = std::fs::read(h.leases_path()).unwrap();

    h.ledger.remove(&s);
    let report = h.reaper.sweep(true).await;

    assert!(report.dry_run);
    assert_eq!(report.revoked, vec![s]);
    assert_eq!(std::fs::read(h.leases_path()).unwrap(), before);
    assert!(h.tunnel.contains(&key));
    assert!(h.authorizer.leases().get(&s).is_some());

    // The real pass acts on the same verdict
    let report = h.reaper.sweep(false).await;
    assert_eq!(report.revoked, vec![s]);
    assert!(!h.tunnel.contains(&key));
}

#[tokio::test]
async fn test_ledger_outage_never_revokes() {
    let mut h = Harness::new();
    let alice = owner();
    let s = h.open_session(&alice, NOW + 60, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    h.authorizer.authorize(&request(&alice, &s, &key)).await.unwrap();

    h.clock.advance(120);
    h.ledger.set_offline(true);
    let report = h.reaper.sweep(false).await;
    assert!(report.revoked.is_empty());
    assert_eq!(report.skipped_unreachable, 1);
    assert!(h.tunnel.contains(&key));

    h.ledger.set_offline(false);
    assert_eq!(h.reaper.sweep(false).await.revoked, vec![s]);
}

#[tokio::test]
async fn test_busy_session_is_skipped() {
    let mut h = Harness::new();
    let alice = owner();
    let s = h.open_session(&alice, NOW + 60, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    h.authorizer.authorize(&request(&alice, &s, &key)).await.unwrap();
    h.clock.advance(120);

    let held = h.authorizer.locks().try_acquire(s).unwrap();
    let report = h.reaper.sweep(false).await;
    assert_eq!(report.skipped_busy, 1);
    assert!(report.revoked.is_empty());
    drop(held);

    assert_eq!(h.reaper.sweep(false).await.revoked, vec![s]);
}

#[tokio::test]
async fn test_failed_peer_removal_keeps_lease() {
    let mut h = Harness::new();
    let alice = owner();
    let s = h.open_session(&alice, NOW + 60, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    h.authorizer.authorize(&request(&alice, &s, &key)).await.unwrap();
    h.clock.advance(120);

    h.tunnel.set_fail_removes(true);
    let report = h.reaper.sweep(false).await;
    assert!(report.revoked.is_empty());
    assert!(report.removal_failures >= 1);
    assert!(h.authorizer.leases().get(&s).is_some());

    h.tunnel.set_fail_removes(false);
    assert_eq!(h.reaper.sweep(false).await.revoked, vec![s]);
}

#[tokio::test]
async fn test_orphaned_pool_peers_are_removed() {
    let h = Harness::new();
    let orphan = TunnelKeyPair::generate().public_key();
    let outsider = TunnelKeyPair::generate().public_key();
    h.tunnel.insert_peer(orphan, "10.10.0.77".parse().unwrap());
    h.tunnel.insert_peer(outsider, "192.168.5.2".parse().unwrap());

    let dry = h.reaper.sweep(true).await;
    assert_eq!(dry.orphans_removed, vec![orphan]);
    assert!(h.tunnel.contains(&orphan));

    let report = h.reaper.sweep(false).await;
    assert_eq!(report.orphans_removed, vec![orphan]);
    assert!(!h.tunnel.contains(&orphan));
    // Peers outside the pool belong to someone else
    assert!(h.tunnel.contains(&outsider));
}

#[tokio::test]
async fn test_reserved_pool_addresses_are_never_orphans() {
    let h = Harness::new();
    let gateway = TunnelKeyPair::generate().public_key();
    let network = TunnelKeyPair::generate().public_key();
    let broadcast = TunnelKeyPair::generate().public_key();
    h.tunnel.insert_peer(gateway, "10.10.0.1".parse().unwrap());
    h.tunnel.insert_peer(network, "10.10.0.0".parse().unwrap());
    h.tunnel.insert_peer(broadcast, "10.10.0.255".parse().unwrap());

    let report = h.reaper.sweep(false).await;
    assert!(report.orphans_removed.is_empty());
    assert!(h.tunnel.contains(&gateway));
    assert!(h.tunnel.contains(&network));
    assert!(h.tunnel.contains(&broadcast));
}

#[tokio::test]
async fn test_in_flight_key_is_not_an_orphan() {
    let h = Harness::new();
    let key = TunnelKeyPair::generate().public_key();
    h.tunnel.insert_peer(key, "10.10.0.90".parse().unwrap());

    let mut guard = h.authorizer.locks().try_acquire(dv_core::Pubkey::new([0x42; 32])).unwrap();
    guard.mark_in_flight(key);
    let report = h.reaper.sweep(false).await;
    assert!(report.orphans_removed.is_empty());
    assert!(h.tunnel.contains(&key));
}

#[tokio::test]
async fn test_parked_lease_is_committed_by_next_sweep() {
    let mut h = Harness::new();
    let alice = owner();
    let s = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    h.break_state_dir();
    let grant = h.authorizer.authorize(&request(&alice, &s, &key)).await.unwrap();
    assert!(!grant.persisted);

    // Pending leases count as referenced, so the peer is no orphan
    let report = h.reaper.sweep(false).await;
    assert_eq!(report.pending_flushed, 0);
    assert!(report.orphans_removed.is_empty());
    assert!(h.tunnel.contains(&key));

    h.repair_state_dir();
    let report = h.reaper.sweep(false).await;
    assert_eq!(report.pending_flushed, 1);
    assert_eq!(h.authorizer.leases().pending_count(), 0);
    assert!(h.authorizer.leases().is_committed(&s));
    let on_disk = std::fs::read_to_string(h.leases_path()).unwrap();
    assert!(on_disk.contains(&s.to_string()));
}

#[tokio::test]
async fn test_reaper_run_stops_on_cancel() {
    let h = Harness::new();
    let cancel = tokio_util::sync::CancellationToken::new();
    let reaper = dv_core::ExpiryReaper::new(h.authorizer.clone());
    let stop = cancel.clone();

    let handle = tokio::spawn(async move {
        reaper.run(std::time::Duration::from_millis(10), stop).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
