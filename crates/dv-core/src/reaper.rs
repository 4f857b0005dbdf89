//! Expiry reaper
//!
//! One sweep routine serves both the periodic timer and the on-demand
//! `dvpn sweep` command. A sweep never revokes on a failed ledger read; it
//! waits for a pass where the ledger answers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authorizer::PeerAuthorizer;
use crate::crypto::TunnelKey;
use crate::error::DvpnError;
use crate::ledger::{Pubkey, SessionState};
use crate::tunnel;

/// What one sweep did (or would have done, when dry)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub dry_run: bool,
    pub examined: usize,
    pub revoked: Vec<Pubkey>,
    pub orphans_removed: Vec<TunnelKey>,
    pub skipped_busy: usize,
    pub skipped_unreachable: usize,
    pub removal_failures: usize,
    pub pending_flushed: usize,
    pub commit_failed: bool,
}

enum Verdict {
    Keep,
    Revoke(&'static str),
    Unreachable,
}

/// Revokes leases whose sessions ended or vanished
pub struct ExpiryReaper {
    authorizer: Arc<PeerAuthorizer>,
    dry_run: bool,
}

impl ExpiryReaper {
    pub fn new(authorizer: Arc<PeerAuthorizer>) -> Self {
        Self { authorizer, dry_run: false }
    }

    /// Builder pattern: make timer-driven sweeps dry
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn authorizer(&self) -> &Arc<PeerAuthorizer> {
        &self.authorizer
    }

    async fn judge(&self, session: &Pubkey) -> Verdict {
        let verifier = self.authorizer.verifier();
        match verifier.load(session).await {
            Ok(account) if verifier.clock().now() >= account.end_ts => Verdict::Revoke("session expired"),
            Ok(account) if account.state != SessionState::Active => Verdict::Revoke("session no longer active"),
            Ok(_) => Verdict::Keep,
            Err(DvpnError::NotFound(_)) => Verdict::Revoke("session account gone"),
            Err(DvpnError::Decode(_)) => Verdict::Revoke("session account no longer decodes"),
            Err(e) => {
                warn!(session = %session, "Ledger read failed, keeping lease this pass: {}", e);
                Verdict::Unreachable
            }
        }
    }

    /// One pass over every lease, then over unreferenced tunnel peers
    pub async fn sweep(&self, dry_run: bool) -> SweepReport {
        let leases = self.authorizer.leases();
        let locks = self.authorizer.locks();
        let policy = self.authorizer.settings().retry;
        let tunnel = self.authorizer.tunnel().as_ref();
        let mut report = SweepReport { dry_run, ..Default::default() };

        if dry_run {
            if leases.pending_count() > 0 {
                info!(count = leases.pending_count(), "Dry run: would retry committing parked leases");
            }
        } else {
            match leases.flush_pending().await {
                Ok(n) => report.pending_flushed = n,
                Err(e) => warn!("Parked leases still not committed: {}", e),
            }
        }

        if !dry_run {
            self.prune_revoked().await;
        }

        let snapshot = leases.snapshot();
        let mut guards = Vec::new();
        let mut doomed = Vec::new();

        for (session, lease) in &snapshot {
            report.examined += 1;
            let Some(guard) = locks.try_acquire(*session) else {
                debug!(session = %session, "Session busy, skipping this pass");
                report.skipped_busy += 1;
                continue;
            };

            let reason = match self.judge(session).await {
                Verdict::Keep => continue,
                Verdict::Unreachable => {
                    report.skipped_unreachable += 1;
                    continue;
                }
                Verdict::Revoke(reason) => reason,
            };

            if dry_run {
                info!(session = %session, address = %lease.allocated_address, "Dry run: would revoke ({})", reason);
                report.revoked.push(*session);
                continue;
            }

            let shared = snapshot
                .iter()
                .any(|(s, l)| s != session && l.client_tunnel_key == lease.client_tunnel_key);
            if !shared {
                if let Err(e) = tunnel::remove_peer(tunnel, &lease.client_tunnel_key, &policy).await {
                    warn!(session = %session, "Could not remove tunnel peer, keeping lease: {}", e);
                    report.removal_failures += 1;
                    continue;
                }
            }
            info!(session = %session, address = %lease.allocated_address, "Revoking lease ({})", reason);
            doomed.push(*session);
            guards.push(guard);
        }

        if !doomed.is_empty() {
            match leases.commit(&[], &doomed).await {
                Ok(()) => {
                    for session in &doomed {
                        self.authorizer.mark_revoked(*session);
                    }
                    report.revoked = doomed;
                }
                Err(e) => {
                    warn!(count = doomed.len(), "Lease deletions not committed, retrying next pass: {}", e);
                    report.commit_failed = true;
                }
            }
        }
        drop(guards);

        self.reap_orphans(dry_run, &mut report).await;

        info!(
            examined = report.examined,
            revoked = report.revoked.len(),
            orphans = report.orphans_removed.len(),
            dry_run,
            "Sweep finished"
        );
        report
    }

    /// Drop remembered revocations whose session accounts have been closed
    async fn prune_revoked(&self) {
        let verifier = self.authorizer.verifier();
        for session in self.authorizer.revoked_sessions() {
            if let Err(DvpnError::NotFound(_)) = verifier.fetch(&session).await {
                debug!(session = %session, "Session account gone, forgetting revocation");
                self.authorizer.forget_revoked(&session);
            }
        }
    }

    /// Tunnel peers at allocatable pool addresses that no lease references
    async fn reap_orphans(&self, dry_run: bool, report: &mut SweepReport) {
        let settings = self.authorizer.settings();
        let tunnel = self.authorizer.tunnel().as_ref();

        let peers = match tokio::time::timeout(settings.retry.call_timeout, tunnel.list_peers()).await {
            Ok(Ok(peers)) => peers,
            Ok(Err(e)) => {
                warn!("Could not list tunnel peers: {}", e);
                return;
            }
            Err(_) => {
                warn!("Listing tunnel peers timed out");
                return;
            }
        };

        // Snapshot after listing, so a grant that lands in between is seen
        let referenced: HashSet<TunnelKey> = self
            .authorizer
            .leases()
            .snapshot()
            .values()
            .map(|l| l.client_tunnel_key)
            .collect();

        for peer in peers {
            if !peer.allowed_ips.iter().any(|ip| settings.pool.is_allocatable(*ip)) {
                continue;
            }
            if referenced.contains(&peer.key) || self.authorizer.locks().is_in_flight(&peer.key) {
                continue;
            }
            if dry_run {
                info!(peer = %peer.key, "Dry run: would remove orphaned tunnel peer");
                report.orphans_removed.push(peer.key);
                continue;
            }
            match tunnel::remove_peer(tunnel, &peer.key, &settings.retry).await {
                Ok(()) => {
                    info!(peer = %peer.key, "Removed orphaned tunnel peer");
                    report.orphans_removed.push(peer.key);
                }
                Err(e) => {
                    warn!(peer = %peer.key, "Could not remove orphaned peer: {}", e);
                    report.removal_failures += 1;
                }
            }
        }
    }

    /// Sweep every `interval` until `cancel` fires
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(every = ?interval, dry_run = self.dry_run, "Expiry reaper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Expiry reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep(self.dry_run).await;
                }
            }
        }
    }
}
