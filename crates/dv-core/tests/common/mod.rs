//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dv_core::authorizer::{AuthorizeRequest, AuthorizerSettings, PeerAuthorizer, ServerPeerInfo};
use dv_core::clock::ManualClock;
use dv_core::crypto::{self, AddressPool, TunnelKey, TunnelKeyPair};
use dv_core::lease::{LeaseStore, LockRetry};
use dv_core::ledger::memory::MemoryLedger;
use dv_core::ledger::{encode_account, LedgerAccount, Pubkey, SessionAccount, SessionState, LATEST_LAYOUT};
use dv_core::locks::SessionLocks;
use dv_core::reaper::ExpiryReaper;
use dv_core::session::SessionVerifier;
use dv_core::tunnel::{MemoryTunnel, RetryPolicy};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

pub const NOW: i64 = 1_700_000_000;
pub const FLOOR: u64 = 1000;

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub ledger: Arc<MemoryLedger>,
    pub tunnel: Arc<MemoryTunnel>,
    pub clock: Arc<ManualClock>,
    pub authorizer: Arc<PeerAuthorizer>,
    pub reaper: ExpiryReaper,
    next_session: u8,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let tunnel = Arc::new(MemoryTunnel::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let leases = Arc::new(LeaseStore::open(dir.path().join("state").join("peers.json"), quick_lock()).unwrap());
        let verifier = Arc::new(SessionVerifier::new(ledger.clone(), clock.clone(), LATEST_LAYOUT, FLOOR));
        let authorizer = Arc::new(PeerAuthorizer::new(
            verifier,
            tunnel.clone(),
            leases,
            SessionLocks::new(),
            AuthorizerSettings {
                pool: AddressPool::new("10.10.0.0/24", 4).unwrap(),
                keepalive_secs: 25,
                retry: RetryPolicy {
                    attempts: 3,
                    backoff: Duration::from_millis(1),
                    call_timeout: Duration::from_millis(200),
                },
            },
            ServerPeerInfo {
                public_key: TunnelKeyPair::generate().public_key(),
                endpoint: "203.0.113.7:51820".to_string(),
            },
        ));
        let reaper = ExpiryReaper::new(authorizer.clone());
        Self {
            dir,
            ledger,
            tunnel,
            clock,
            authorizer,
            reaper,
            next_session: 1,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn leases_path(&self) -> PathBuf {
        self.state_dir().join("peers.json")
    }

    /// Write a session account owned by `owner` and return its address
    pub fn open_session(&mut self, owner: &SigningKey, end_ts: i64, escrow: u64) -> Pubkey {
        let address = Pubkey::new([self.next_session; 32]);
        self.next_session += 1;
        self.put_session(address, session(crypto::owner_pubkey(owner), end_ts, escrow));
        address
    }

    pub fn put_session(&self, address: Pubkey, account: SessionAccount) {
        let bytes = encode_account(&LedgerAccount::Session(account), LATEST_LAYOUT).unwrap();
        self.ledger.insert(address, bytes);
    }

    /// Make the lease directory unwritable by putting a file in its place
    pub fn break_state_dir(&self) {
        let dir = self.state_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir).unwrap();
        }
        std::fs::write(&dir, b"in the way").unwrap();
    }

    pub fn repair_state_dir(&self) {
        std::fs::remove_file(self.state_dir()).unwrap();
    }
}

pub fn quick_lock() -> LockRetry {
    LockRetry {
        retries: 2,
        base: Duration::from_millis(1),
        factor: 2,
    }
}

pub fn owner() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn session(user: Pubkey, end_ts: i64, escrow: u64) -> SessionAccount {
    SessionAccount {
        user,
        node: Pubkey::new([0xAA; 32]),
        session_id: 7,
        start_ts: end_ts - 3600,
        end_ts,
        escrow_lamports: escrow,
        remaining_balance: escrow,
        bytes_used: 0,
        last_proof_hash: [0; 32],
        payment_token: Pubkey::default(),
        state: SessionState::Active,
        bump: 254,
    }
}

pub fn request(signer: &SigningKey, session: &Pubkey, key: &TunnelKey) -> AuthorizeRequest {
    AuthorizeRequest {
        session_id: session.to_string(),
        client_tunnel_key: key.to_base64(),
        signature: crypto::sign_tunnel_key(signer, key),
    }
}
