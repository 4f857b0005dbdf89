//! In-process ledger

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{LedgerClient, Pubkey};
use crate::error::{DvpnError, Result};

/// Map-backed ledger with a switch to simulate an unreachable endpoint
#[derive(Default)]
pub struct MemoryLedger {
    accounts: RwLock<BTreeMap<Pubkey, Bytes>>,
    offline: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: Pubkey, data: impl Into<Bytes>) {
        self.accounts.write().insert(address, data.into());
    }

    pub fn remove(&self, address: &Pubkey) -> Option<Bytes> {
        self.accounts.write().remove(address)
    }

    /// While offline every read fails with `LedgerUnavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DvpnError::LedgerUnavailable("memory ledger offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn read_account(&self, address: &Pubkey) -> Result<Option<Bytes>> {
        self.check_online()?;
        Ok(self.accounts.read().get(address).cloned())
    }

    async fn list_accounts(&self, discriminator: &[u8; 8]) -> Result<Vec<(Pubkey, Bytes)>> {
        self.check_online()?;
        Ok(self
            .accounts
            .read()
            .iter()
            .filter(|(_, data)| data.starts_with(discriminator))
            .map(|(key, data)| (*key, data.clone()))
            .collect())
    }
}
