//! Per-session mutual exclusion
//!
//! Guards never wait: a second caller for the same session gets `None` and
//! reports `Busy`. A guard may also claim the tunnel address it is about to
//! hand out, so two sessions never provision the same /32 at once.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::crypto::TunnelKey;
use crate::ledger::Pubkey;

#[derive(Default)]
struct Held {
    sessions: HashSet<Pubkey>,
    /// Keys with a count of guards provisioning them
    in_flight: HashMap<TunnelKey, usize>,
    claims: HashMap<Ipv4Addr, Pubkey>,
}

/// Owned set of session guards, shared by the authorizer and the reaper
#[derive(Clone, Default)]
pub struct SessionLocks {
    held: Arc<Mutex<Held>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the guard for `session` if nobody holds it
    pub fn try_acquire(&self, session: Pubkey) -> Option<SessionGuard> {
        let mut held = self.held.lock();
        if !held.sessions.insert(session) {
            return None;
        }
        Some(SessionGuard {
            held: Arc::clone(&self.held),
            session,
            keys: Vec::new(),
            addresses: Vec::new(),
        })
    }

    pub fn is_held(&self, session: &Pubkey) -> bool {
        self.held.lock().sessions.contains(session)
    }

    /// A tunnel key some guard is currently provisioning or replacing
    pub fn is_in_flight(&self, key: &TunnelKey) -> bool {
        self.held.lock().in_flight.contains_key(key)
    }

    /// Session currently claiming `address`, if any
    pub fn claimant(&self, address: &Ipv4Addr) -> Option<Pubkey> {
        self.held.lock().claims.get(address).copied()
    }
}

/// Exclusive hold on one session; released on drop
pub struct SessionGuard {
    held: Arc<Mutex<Held>>,
    session: Pubkey,
    keys: Vec<TunnelKey>,
    addresses: Vec<Ipv4Addr>,
}

impl SessionGuard {
    pub fn session(&self) -> &Pubkey {
        &self.session
    }

    /// Mark `key` as being provisioned until this guard drops
    pub fn mark_in_flight(&mut self, key: TunnelKey) {
        if self.keys.contains(&key) {
            return;
        }
        *self.held.lock().in_flight.entry(key).or_insert(0) += 1;
        self.keys.push(key);
    }

    /// Claim `address` until this guard drops. False when another session
    /// holds the claim.
    pub fn claim_address(&mut self, address: Ipv4Addr) -> bool {
        let mut held = self.held.lock();
        match held.claims.get(&address) {
            Some(holder) if *holder != self.session => false,
            Some(_) => true,
            None => {
                held.claims.insert(address, self.session);
                self.addresses.push(address);
                true
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock();
        held.sessions.remove(&self.session);
        for key in &self.keys {
            if let Some(count) = held.in_flight.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    held.in_flight.remove(key);
                }
            }
        }
        for address in &self.addresses {
            held.claims.remove(address);
        }
    }
}
