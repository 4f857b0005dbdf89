//! In-process tunnel interface

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{TunnelControl, TunnelPeer};
use crate::crypto::TunnelKey;
use crate::error::{DvpnError, Result};

/// Peer table kept in memory, with fault injection for tests
#[derive(Default)]
pub struct MemoryTunnel {
    peers: Mutex<HashMap<TunnelKey, TunnelPeer>>,
    add_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    failing_adds: AtomicU32,
    fail_removes: AtomicBool,
    hang: AtomicBool,
}

impl MemoryTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer directly, bypassing the call counters
    pub fn insert_peer(&self, key: TunnelKey, address: Ipv4Addr) {
        self.peers.lock().insert(key, TunnelPeer { key, allowed_ips: vec![address] });
    }

    pub fn contains(&self, key: &TunnelKey) -> bool {
        self.peers.lock().contains_key(key)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Drop every peer, as an interface restart would
    pub fn clear(&self) {
        self.peers.lock().clear();
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// The next `n` adds fail
    pub fn fail_next_adds(&self, n: u32) {
        self.failing_adds.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Every call blocks far past any sane timeout
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    async fn maybe_hang(&self) {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl TunnelControl for MemoryTunnel {
    async fn list_peers(&self) -> Result<Vec<TunnelPeer>> {
        self.maybe_hang().await;
        Ok(self.peers.lock().values().cloned().collect())
    }

    async fn add_or_replace_peer(&self, key: &TunnelKey, address: Ipv4Addr, _keepalive_secs: u16) -> Result<()> {
        self.maybe_hang().await;
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_adds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DvpnError::DaemonUnavailable("injected add failure".to_string()));
        }
        self.peers.lock().insert(*key, TunnelPeer { key: *key, allowed_ips: vec![address] });
        Ok(())
    }

    async fn remove_peer(&self, key: &TunnelKey) -> Result<()> {
        self.maybe_hang().await;
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(DvpnError::DaemonUnavailable("injected remove failure".to_string()));
        }
        self.peers.lock().remove(key);
        Ok(())
    }
}
