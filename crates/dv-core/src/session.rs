//! Session verification
//!
//! Read-only gate in front of every grant: the session must decode, belong to
//! the caller, still be running and still be funded.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{DvpnError, Result};
use crate::ledger::{decode_session, LedgerClient, Pubkey, SessionAccount, SessionState};

/// A session that passed every check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedSession {
    pub session: SessionAccount,
    /// Seconds until `end_ts`
    pub remaining_secs: i64,
}

/// Verifies session accounts against the clock and funding floor
pub struct SessionVerifier {
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    layout: u16,
    funding_floor: u64,
    read_timeout: Duration,
}

impl SessionVerifier {
    pub fn new(ledger: Arc<dyn LedgerClient>, clock: Arc<dyn Clock>, layout: u16, funding_floor: u64) -> Self {
        Self {
            ledger,
            clock,
            layout,
            funding_floor,
            read_timeout: Duration::from_secs(10),
        }
    }

    /// Builder pattern: bound ledger reads
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn funding_floor(&self) -> u64 {
        self.funding_floor
    }

    pub fn layout(&self) -> u16 {
        self.layout
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Full verification including ownership
    pub fn verify(&self, session_bytes: &[u8], claimed_owner: &Pubkey) -> Result<VerifiedSession> {
        let session = decode_session(session_bytes, self.layout)?;
        if session.user != *claimed_owner {
            return Err(DvpnError::OwnerMismatch {
                expected: claimed_owner.to_string(),
                actual: session.user.to_string(),
            });
        }
        self.check_account(session)
    }

    /// Every check except ownership; callers bind the owner some other way
    pub fn check(&self, session_bytes: &[u8]) -> Result<VerifiedSession> {
        let session = decode_session(session_bytes, self.layout)?;
        self.check_account(session)
    }

    fn check_account(&self, session: SessionAccount) -> Result<VerifiedSession> {
        let now = self.clock.now();
        if now >= session.end_ts {
            return Err(DvpnError::Expired { end_ts: session.end_ts, now });
        }
        // Closing a session refunds it but leaves end_ts in the future
        if session.state != SessionState::Active {
            return Err(DvpnError::SessionInactive(session.state.to_string()));
        }
        if session.escrow_lamports < self.funding_floor {
            return Err(DvpnError::Underfunded {
                escrow: session.escrow_lamports,
                floor: self.funding_floor,
            });
        }
        Ok(VerifiedSession {
            remaining_secs: session.end_ts - now,
            session,
        })
    }

    /// Read raw account bytes, bounded by the read timeout
    pub async fn fetch(&self, address: &Pubkey) -> Result<Bytes> {
        let read = tokio::time::timeout(self.read_timeout, self.ledger.read_account(address))
            .await
            .map_err(|_| {
                DvpnError::LedgerUnavailable(format!("read of {} timed out after {:?}", address, self.read_timeout))
            })??;
        debug!(account = %address, found = read.is_some(), "Fetched ledger account");
        read.ok_or_else(|| DvpnError::NotFound(format!("account {}", address)))
    }

    /// Fetch and decode without checks
    pub async fn load(&self, address: &Pubkey) -> Result<SessionAccount> {
        let bytes = self.fetch(address).await?;
        Ok(decode_session(&bytes, self.layout)?)
    }

    pub async fn verify_address(&self, address: &Pubkey, claimed_owner: &Pubkey) -> Result<VerifiedSession> {
        let bytes = self.fetch(address).await?;
        self.verify(&bytes, claimed_owner)
    }

    pub async fn check_address(&self, address: &Pubkey) -> Result<VerifiedSession> {
        let bytes = self.fetch(address).await?;
        self.check(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::records::fixtures::session;
    use crate::ledger::{encode_account, LedgerAccount};

    const NOW: i64 = 1_700_000_000;

    fn verifier(ledger: Arc<MemoryLedger>) -> SessionVerifier {
        SessionVerifier::new(ledger, Arc::new(ManualClock::new(NOW)), 2, 1000)
    }

    fn bytes(s: &SessionAccount) -> Vec<u8> {
        encode_account(&LedgerAccount::Session(s.clone()), 2).unwrap()
    }

    #[test]
    fn test_expired_session_rejected() {
        let owner = Pubkey::new([1; 32]);
        let v = verifier(Arc::new(MemoryLedger::new()));
        let err = v.verify(&bytes(&session(owner, NOW - 1, 1_000_000)), &owner).unwrap_err();
        assert!(matches!(err, DvpnError::Expired { end_ts, now } if end_ts == NOW - 1 && now == NOW));
    }

    #[test]
    fn test_underfunded_session_rejected() {
        let owner = Pubkey::new([1; 32]);
        let v = verifier(Arc::new(MemoryLedger::new()));
        let err = v.verify(&bytes(&session(owner, NOW + 600, 500)), &owner).unwrap_err();
        assert!(matches!(err, DvpnError::Underfunded { escrow: 500, floor: 1000 }));
    }

    #[test]
    fn test_owner_mismatch_checked_first() {
        let owner = Pubkey::new([1; 32]);
        let v = verifier(Arc::new(MemoryLedger::new()));
        let expired = bytes(&session(owner, NOW - 1, 0));
        assert!(matches!(
            v.verify(&expired, &Pubkey::new([2; 32])),
            Err(DvpnError::OwnerMismatch { .. })
        ));
        // `check` skips ownership entirely
        assert!(matches!(v.check(&expired), Err(DvpnError::Expired { .. })));
    }

    #[test]
    fn test_closed_session_rejected_before_end() {
        let owner = Pubkey::new([1; 32]);
        let mut s = session(owner, NOW + 600, 1_000_000);
        s.state = SessionState::Closed;
        let v = verifier(Arc::new(MemoryLedger::new()));
        assert!(matches!(v.verify(&bytes(&s), &owner), Err(DvpnError::SessionInactive(_))));
    }

    #[test]
    fn test_valid_session_reports_remaining_time() {
        let owner = Pubkey::new([1; 32]);
        let v = verifier(Arc::new(MemoryLedger::new()));
        let ok = v.verify(&bytes(&session(owner, NOW + 600, 1000)), &owner).unwrap();
        assert_eq!(ok.remaining_secs, 600);
        // Repeatable
        assert_eq!(v.verify(&bytes(&ok.session), &owner).unwrap(), ok);
    }

    #[tokio::test]
    async fn test_fetch_maps_absent_and_offline() {
        let ledger = Arc::new(MemoryLedger::new());
        let v = verifier(ledger.clone());
        let address = Pubkey::new([7; 32]);
        assert!(matches!(v.fetch(&address).await, Err(DvpnError::NotFound(_))));

        ledger.set_offline(true);
        assert!(matches!(v.fetch(&address).await, Err(DvpnError::LedgerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_verify_address_reads_through_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let owner = Pubkey::new([1; 32]);
        let address = Pubkey::new([7; 32]);
        ledger.insert(address, bytes(&session(owner, NOW + 60, 5_000)));
        let v = verifier(ledger);
        assert_eq!(v.verify_address(&address, &owner).await.unwrap().remaining_secs, 60);
    }
}
