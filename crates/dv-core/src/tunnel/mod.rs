//! Tunnel subsystem control
//!
//! [`TunnelControl`] exposes the two peer mutations the kernel interface
//! supports. Callers go through [`ensure_peer`], which composes them into one
//! retryable, bounded operation.

pub mod memory;
pub mod wg;

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::crypto::TunnelKey;
use crate::error::{DvpnError, Result};

pub use memory::MemoryTunnel;
pub use wg::WgTunnel;

/// One peer as reported by the tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPeer {
    pub key: TunnelKey,
    /// Host addresses from the peer's `/32` allowed-ips entries
    pub allowed_ips: Vec<Ipv4Addr>,
}

/// Peer management on a tunnel interface; every call must be safe to repeat
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn list_peers(&self) -> Result<Vec<TunnelPeer>>;

    async fn add_or_replace_peer(&self, key: &TunnelKey, address: Ipv4Addr, keepalive_secs: u16) -> Result<()>;

    /// Removing an absent peer succeeds
    async fn remove_peer(&self, key: &TunnelKey) -> Result<()>;
}

/// Bounds on tunnel calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
            call_timeout: Duration::from_secs(5),
        }
    }
}

async fn bounded<T>(limit: Duration, what: &str, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DvpnError::DaemonUnavailable(format!("{} timed out after {:?}", what, limit))),
    }
}

/// Whether the interface currently lists `key`
pub async fn has_peer(tunnel: &dyn TunnelControl, key: &TunnelKey, policy: &RetryPolicy) -> Result<bool> {
    let peers = bounded(policy.call_timeout, "list peers", tunnel.list_peers()).await?;
    Ok(peers.iter().any(|p| p.key == *key))
}

/// Remove `key`, bounded by the policy timeout
pub async fn remove_peer(tunnel: &dyn TunnelControl, key: &TunnelKey, policy: &RetryPolicy) -> Result<()> {
    bounded(policy.call_timeout, "remove peer", tunnel.remove_peer(key)).await
}

/// Make `key` a peer with exactly `address/32`: drop any stale entry, then
/// add it. Retried up to `policy.attempts` times.
pub async fn ensure_peer(
    tunnel: &dyn TunnelControl,
    key: &TunnelKey,
    address: Ipv4Addr,
    keepalive_secs: u16,
    policy: &RetryPolicy,
) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.backoff;
    let mut last_err = None;

    for attempt in 1..=attempts {
        let result = async {
            bounded(policy.call_timeout, "remove peer", tunnel.remove_peer(key)).await?;
            bounded(
                policy.call_timeout,
                "add peer",
                tunnel.add_or_replace_peer(key, address, keepalive_secs),
            )
            .await
        }
        .await;

        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(peer = %key, attempt, "ensure_peer failed: {}", e);
                last_err = Some(e);
            }
        }

        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    Err(match last_err {
        Some(DvpnError::DaemonUnavailable(msg)) => DvpnError::DaemonUnavailable(msg),
        Some(other) => DvpnError::DaemonUnavailable(other.to_string()),
        None => DvpnError::DaemonUnavailable("no attempts made".to_string()),
    })
}
