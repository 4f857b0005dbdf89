//! Authorization flows against the in-memory ledger and tunnel

mod common;

use common::{owner, request, Harness, NOW};
use dv_core::authorizer::{LeaseState, RevokeOutcome};
use dv_core::crypto::TunnelKeyPair;
use dv_core::DvpnError;

#[tokio::test]
async fn scenario_1_expired_session_is_rejected() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW - 1, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    let result = h.authorizer.authorize(&request(&alice, &session, &key)).await;
    assert!(matches!(result, Err(DvpnError::Expired { .. })));
    assert_eq!(h.tunnel.peer_count(), 0);
}

#[tokio::test]
async fn scenario_2_underfunded_session_is_rejected() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 500);
    let key = TunnelKeyPair::generate().public_key();

    let result = h.authorizer.authorize(&request(&alice, &session, &key)).await;
    assert!(matches!(result, Err(DvpnError::Underfunded { escrow: 500, floor: 1000 })));
}

#[tokio::test]
async fn scenario_3_repeated_authorize_is_idempotent() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    let req = request(&alice, &session, &key);

    let first = h.authorizer.authorize(&req).await.unwrap();
    let second = h.authorizer.authorize(&req).await.unwrap();

    assert_eq!(first.allocated_address, second.allocated_address);
    assert!(!first.reused);
    assert!(second.reused);
    assert!(second.persisted);
    assert_eq!(h.tunnel.peer_count(), 1);
    assert_eq!(h.tunnel.add_calls(), 1);
    assert_eq!(h.authorizer.state(&session), LeaseState::Authorized);
}

#[tokio::test]
async fn test_foreign_signature_is_rejected() {
    let mut h = Harness::new();
    let alice = owner();
    let mallory = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    let result = h.authorizer.authorize(&request(&mallory, &session, &key)).await;
    assert!(matches!(result, Err(DvpnError::InvalidSignature(_))));
    assert_eq!(h.tunnel.peer_count(), 0);
    assert!(h.authorizer.leases().is_empty());
}

#[tokio::test]
async fn test_missing_session_is_not_found() {
    let h = Harness::new();
    let alice = owner();
    let key = TunnelKeyPair::generate().public_key();
    let ghost = dv_core::Pubkey::new([0xEE; 32]);

    let result = h.authorizer.authorize(&request(&alice, &ghost, &key)).await;
    assert!(matches!(result, Err(DvpnError::NotFound(_))));
}

#[tokio::test]
async fn test_grant_is_persisted_with_client_config() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    let grant = h.authorizer.authorize(&request(&alice, &session, &key)).await.unwrap();
    assert!(grant.persisted);
    let interface = format!("{}/32", grant.allocated_address);
    assert_eq!(grant.client_config.interface.address, interface);
    assert_eq!(grant.client_config.peer.allowed_ips, "0.0.0.0/0");
    assert_eq!(grant.client_config.peer.persistent_keepalive, 25);

    let on_disk = std::fs::read_to_string(h.leases_path()).unwrap();
    assert!(on_disk.contains(&session.to_string()));
    assert!(on_disk.contains(&key.to_base64()));
    assert!(h.tunnel.contains(&key));
}

#[tokio::test]
async fn test_new_key_replaces_old_peer() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let old = TunnelKeyPair::generate().public_key();
    let new = TunnelKeyPair::generate().public_key();

    h.authorizer.authorize(&request(&alice, &session, &old)).await.unwrap();
    h.authorizer.authorize(&request(&alice, &session, &new)).await.unwrap();

    assert!(!h.tunnel.contains(&old));
    assert!(h.tunnel.contains(&new));
    assert_eq!(h.tunnel.peer_count(), 1);
    assert_eq!(h.authorizer.leases().get(&session).unwrap().client_tunnel_key, new);
}

#[tokio::test]
async fn test_missing_peer_is_provisioned_again() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    let req = request(&alice, &session, &key);

    let first = h.authorizer.authorize(&req).await.unwrap();
    // Interface flushed behind our back
    h.tunnel.clear();
    let second = h.authorizer.authorize(&req).await.unwrap();

    assert!(!second.reused);
    assert_eq!(first.allocated_address, second.allocated_address);
    assert!(h.tunnel.contains(&key));
}

#[tokio::test]
async fn test_same_key_on_second_owner_conflicts() {
    let mut h = Harness::new();
    let alice = owner();
    let bob = owner();
    let first = h.open_session(&alice, NOW + 3600, 1_000_000);
    let second = h.open_session(&bob, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    h.authorizer.authorize(&request(&alice, &first, &key)).await.unwrap();
    let result = h.authorizer.authorize(&request(&bob, &second, &key)).await;
    assert!(matches!(result, Err(DvpnError::AddressConflict { .. })));
    assert_eq!(h.authorizer.leases().len(), 1);
}

#[tokio::test]
async fn test_same_owner_moves_key_to_new_session() {
    let mut h = Harness::new();
    let alice = owner();
    let first = h.open_session(&alice, NOW + 3600, 1_000_000);
    let second = h.open_session(&alice, NOW + 7200, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    let a = h.authorizer.authorize(&request(&alice, &first, &key)).await.unwrap();
    let b = h.authorizer.authorize(&request(&alice, &second, &key)).await.unwrap();

    assert_eq!(a.allocated_address, b.allocated_address);
    assert!(h.authorizer.leases().get(&first).is_none());
    assert!(h.authorizer.leases().get(&second).is_some());
    assert_eq!(h.tunnel.peer_count(), 1);
}

#[tokio::test]
async fn test_busy_session_is_rejected() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    let _held = h.authorizer.locks().try_acquire(session).unwrap();
    let result = h.authorizer.authorize(&request(&alice, &session, &key)).await;
    assert!(matches!(result, Err(DvpnError::Busy(_))));
}

#[tokio::test]
async fn test_tunnel_failure_is_daemon_unavailable() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    h.tunnel.fail_next_adds(10);
    let result = h.authorizer.authorize(&request(&alice, &session, &key)).await;
    assert!(matches!(result, Err(DvpnError::DaemonUnavailable(_))));
    assert!(h.authorizer.leases().is_empty());
    // The guard is released after a failed attempt
    assert!(!h.authorizer.locks().is_held(&session));
}

#[tokio::test]
async fn test_transient_tunnel_failure_is_retried() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    h.tunnel.fail_next_adds(1);
    let grant = h.authorizer.authorize(&request(&alice, &session, &key)).await.unwrap();
    assert!(h.tunnel.contains(&key));
    assert!(grant.persisted);
}

#[tokio::test]
async fn test_persistence_failure_still_grants_and_parks_lease() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();

    h.break_state_dir();
    let req = request(&alice, &session, &key);
    let grant = h.authorizer.authorize(&req).await.unwrap();
    assert!(!grant.persisted);
    assert!(h.tunnel.contains(&key));
    assert_eq!(h.authorizer.leases().pending_count(), 1);

    // Still idempotent while parked
    let again = h.authorizer.authorize(&req).await.unwrap();
    assert!(again.reused);
    assert!(!again.persisted);
    assert_eq!(again.allocated_address, grant.allocated_address);
}

#[tokio::test]
async fn test_revoke_then_authorize_again() {
    let mut h = Harness::new();
    let alice = owner();
    let session = h.open_session(&alice, NOW + 3600, 1_000_000);
    let key = TunnelKeyPair::generate().public_key();
    let req = request(&alice, &session, &key);

    h.authorizer.authorize(&req).await.unwrap();
    match h.authorizer.revoke(&session).await.unwrap() {
        RevokeOutcome::Revoked(lease) => assert_eq!(lease.client_tunnel_key, key),
        RevokeOutcome::NotLeased => panic!("lease should have existed"),
    }
    assert_eq!(h.authorizer.state(&session), LeaseState::Revoked);
    assert!(!h.tunnel.contains(&key));
    assert_eq!(h.authorizer.revoke(&session).await.unwrap(), RevokeOutcome::NotLeased);

    let grant = h.authorizer.authorize(&req).await.unwrap();
    assert!(!grant.reused);
    assert_eq!(h.authorizer.state(&session), LeaseState::Authorized);
}

#[tokio::test]
async fn test_distinct_sessions_authorize_concurrently() {
    let mut h = Harness::new();
    let alice = owner();
    let bob = owner();
    let s1 = h.open_session(&alice, NOW + 3600, 1_000_000);
    let s2 = h.open_session(&bob, NOW + 3600, 1_000_000);
    let pool = h.authorizer.settings().pool;
    let k1 = TunnelKeyPair::generate().public_key();
    let k2 = std::iter::repeat_with(|| TunnelKeyPair::generate().public_key())
        .find(|k| pool.allocate(k) != pool.allocate(&k1))
        .unwrap();
    let r1 = request(&alice, &s1, &k1);
    let r2 = request(&bob, &s2, &k2);

    let (a, b) = tokio::join!(h.authorizer.authorize(&r1), h.authorizer.authorize(&r2));
    assert_ne!(a.unwrap().allocated_address, b.unwrap().allocated_address);
    assert_eq!(h.tunnel.peer_count(), 2);
    assert_eq!(h.authorizer.leases().len(), 2);
}

#[tokio::test]
async fn test_colliding_keys_never_share_an_address() {
    let mut h = Harness::new();
    let alice = owner();
    let bob = owner();
    let s1 = h.open_session(&alice, NOW + 3600, 1_000_000);
    let s2 = h.open_session(&bob, NOW + 3600, 1_000_000);
    let pool = h.authorizer.settings().pool;

    // Two keys hashing to the same /32
    let mut seen = std::collections::HashMap::new();
    let (k1, k2) = loop {
        let key = TunnelKeyPair::generate().public_key();
        if let Some(other) = seen.insert(pool.allocate(&key), key) {
            break (other, key);
        }
    };

    // The first grant stalls in retry backoff while the second runs
    h.tunnel.fail_next_adds(1);
    let r1 = request(&alice, &s1, &k1);
    let r2 = request(&bob, &s2, &k2);
    let (a, b) = tokio::join!(h.authorizer.authorize(&r1), h.authorizer.authorize(&r2));

    let granted = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 1, "a={a:?} b={b:?}");
    assert!([&a, &b].iter().any(|r| matches!(r, Err(DvpnError::AddressConflict { .. }))));
    assert_eq!(h.authorizer.leases().len(), 1);
    assert_eq!(h.tunnel.peer_count(), 1);
    assert_eq!(h.authorizer.locks().claimant(&pool.allocate(&k1)), None);
}
