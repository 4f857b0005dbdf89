//! Persisted peer leases
//!
//! One JSON document maps session address to lease. Writers serialize on an
//! in-process mutex and an advisory lock on `<file>.lock`, then re-read the
//! file, apply their change and replace it atomically. Readers only ever see
//! the last committed snapshot held in memory.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::TunnelKey;
use crate::error::{DvpnError, Result};
use crate::ledger::Pubkey;

/// Live binding between a session and a provisioned tunnel peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLease {
    #[serde(alias = "clientWgPubkey")]
    pub client_tunnel_key: TunnelKey,
    #[serde(alias = "assignedIp")]
    pub allocated_address: Ipv4Addr,
    #[serde(alias = "user")]
    pub owner: Pubkey,
    #[serde(alias = "addedAt")]
    pub created_at: i64,
}

pub type LeaseMap = BTreeMap<Pubkey, PeerLease>;

/// Retry schedule for the advisory file lock
#[derive(Debug, Clone, Copy)]
pub struct LockRetry {
    pub retries: u32,
    pub base: Duration,
    pub factor: u32,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            retries: 5,
            base: Duration::from_millis(50),
            factor: 2,
        }
    }
}

/// Held advisory lock; released when dropped
struct FileLock {
    _file: File,
}

impl FileLock {
    async fn acquire(path: &Path, retry: LockRetry) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| persistence("create state dir", e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| persistence("open lock file", e))?;

        let mut delay = retry.base;
        for attempt in 0..=retry.retries {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { _file: file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if attempt == retry.retries {
                        break;
                    }
                    debug!(lock = %path.display(), attempt, "lease lock busy, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= retry.factor;
                }
                Err(e) => return Err(persistence("lock lease file", e)),
            }
        }
        Err(DvpnError::Persistence(format!(
            "lease file {} still locked after {} retries",
            path.display(),
            retry.retries
        )))
    }
}

fn persistence(context: &str, err: io::Error) -> DvpnError {
    DvpnError::Persistence(format!("{}: {}", context, err))
}

fn read_leases(path: &Path) -> Result<LeaseMap> {
    match fs::read(path) {
        Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Ok(LeaseMap::new()),
        Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
            DvpnError::Persistence(format!("lease file {} is corrupt: {}", path.display(), e))
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LeaseMap::new()),
        Err(e) => Err(persistence("read lease file", e)),
    }
}

/// temp file in the same directory, fsync, rename, fsync the directory
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| DvpnError::Persistence(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| persistence("create state dir", e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| persistence("create temp file", e))?;
    tmp.write_all(data).map_err(|e| persistence("write temp file", e))?;
    tmp.flush().map_err(|e| persistence("flush temp file", e))?;
    tmp.as_file().sync_all().map_err(|e| persistence("fsync temp file", e))?;
    tmp.persist(path).map_err(|e| persistence("rename lease file", e.error))?;

    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| persistence("fsync state dir", e))?;
    Ok(())
}

/// Owned lease store
pub struct LeaseStore {
    path: PathBuf,
    lock_path: PathBuf,
    retry: LockRetry,
    writer: tokio::sync::Mutex<()>,
    committed: RwLock<LeaseMap>,
    /// Leases provisioned but not yet on disk
    pending: RwLock<LeaseMap>,
}

impl LeaseStore {
    /// Open the store at `path`, loading whatever is already committed
    pub fn open(path: impl Into<PathBuf>, retry: LockRetry) -> Result<Self> {
        let path = path.into();
        let committed = read_leases(&path)?;
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");

        info!(path = %path.display(), leases = committed.len(), "Opened lease store");
        Ok(Self {
            lock_path: PathBuf::from(lock_name),
            path,
            retry,
            writer: tokio::sync::Mutex::new(()),
            committed: RwLock::new(committed),
            pending: RwLock::new(LeaseMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lease for a session, pending ones included
    pub fn get(&self, session: &Pubkey) -> Option<PeerLease> {
        if let Some(lease) = self.pending.read().get(session) {
            return Some(lease.clone());
        }
        self.committed.read().get(session).cloned()
    }

    /// Whether a session's lease has reached disk
    pub fn is_committed(&self, session: &Pubkey) -> bool {
        !self.pending.read().contains_key(session) && self.committed.read().contains_key(session)
    }

    /// Committed leases overlaid with pending ones
    pub fn snapshot(&self) -> LeaseMap {
        let mut all = self.committed.read().clone();
        all.extend(self.pending.read().iter().map(|(k, v)| (*k, v.clone())));
        all
    }

    /// Session holding `address`, if any
    pub fn holder_of(&self, address: Ipv4Addr) -> Option<(Pubkey, PeerLease)> {
        self.snapshot()
            .into_iter()
            .find(|(_, lease)| lease.allocated_address == address)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    /// Keep a lease visible while its commit is outstanding
    pub fn park_pending(&self, session: Pubkey, lease: PeerLease) {
        warn!(session = %session, "Lease parked until the next successful commit");
        self.pending.write().insert(session, lease);
    }

    /// Apply upserts and deletions as one atomic commit
    pub async fn commit(&self, upserts: &[(Pubkey, PeerLease)], deletes: &[Pubkey]) -> Result<()> {
        let _writer = self.writer.lock().await;
        let _lock = FileLock::acquire(&self.lock_path, self.retry).await?;

        let mut leases = read_leases(&self.path)?;
        for session in deletes {
            leases.remove(session);
        }
        for (session, lease) in upserts {
            leases.insert(*session, lease.clone());
        }

        let json = serde_json::to_vec_pretty(&leases)?;
        atomic_write(&self.path, &json)?;

        {
            let mut pending = self.pending.write();
            for session in deletes {
                pending.remove(session);
            }
            for (session, lease) in upserts {
                if pending.get(session) == Some(lease) {
                    pending.remove(session);
                }
            }
        }
        *self.committed.write() = leases;
        debug!(upserts = upserts.len(), deletes = deletes.len(), "Committed lease file");
        Ok(())
    }

    pub async fn upsert(&self, session: Pubkey, lease: PeerLease) -> Result<()> {
        self.commit(&[(session, lease)], &[]).await
    }

    pub async fn remove(&self, session: &Pubkey) -> Result<()> {
        self.commit(&[], std::slice::from_ref(session)).await
    }

    /// Retry committing every parked lease; returns how many landed
    pub async fn flush_pending(&self) -> Result<usize> {
        let parked: Vec<(Pubkey, PeerLease)> = self
            .pending
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        if parked.is_empty() {
            return Ok(0);
        }
        self.commit(&parked, &[]).await?;
        info!(count = parked.len(), "Committed parked leases");
        Ok(parked.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TunnelKeyPair;

    fn lease(n: u8) -> PeerLease {
        PeerLease {
            client_tunnel_key: TunnelKeyPair::generate().public_key(),
            allocated_address: Ipv4Addr::new(10, 10, 0, n),
            owner: Pubkey::new([n; 32]),
            created_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_commit_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let store = LeaseStore::open(&path, LockRetry::default()).unwrap();

        let (a, b) = (Pubkey::new([1; 32]), Pubkey::new([2; 32]));
        store.upsert(a, lease(5)).await.unwrap();
        store.upsert(b, lease(6)).await.unwrap();
        store.remove(&a).await.unwrap();

        let reopened = LeaseStore::open(&path, LockRetry::default()).unwrap();
        assert_eq!(reopened.snapshot().len(), 1);
        assert_eq!(reopened.get(&b), store.get(&b));
        assert!(!dir.path().join("peers.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_legacy_field_names_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let session = Pubkey::new([3; 32]);
        let key = TunnelKeyPair::generate().public_key();
        let legacy = format!(
            r#"{{ "{session}": {{ "clientWgPubkey": "{key}", "assignedIp": "10.10.0.44", "addedAt": 1700000000, "user": "{owner}" }} }}"#,
            owner = Pubkey::new([4; 32]),
        );
        fs::write(&path, legacy).unwrap();

        let store = LeaseStore::open(&path, LockRetry::default()).unwrap();
        let got = store.get(&session).unwrap();
        assert_eq!(got.client_tunnel_key, key);
        assert_eq!(got.allocated_address, Ipv4Addr::new(10, 10, 0, 44));
    }

    #[tokio::test]
    async fn test_commit_gives_up_when_lock_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let retry = LockRetry { retries: 2, base: Duration::from_millis(1), factor: 2 };
        let store = LeaseStore::open(&path, retry).unwrap();

        let holder = File::create(dir.path().join("peers.json.lock")).unwrap();
        FileExt::try_lock_exclusive(&holder).unwrap();

        let err = store.upsert(Pubkey::new([1; 32]), lease(5)).await.unwrap_err();
        assert!(matches!(err, DvpnError::Persistence(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_pending_lease_visible_then_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        let store = LeaseStore::open(&path, LockRetry::default()).unwrap();
        let session = Pubkey::new([9; 32]);

        store.park_pending(session, lease(7));
        assert!(store.get(&session).is_some());
        assert!(!store.is_committed(&session));

        assert_eq!(store.flush_pending().await.unwrap(), 1);
        assert!(store.is_committed(&session));
        assert_eq!(store.pending_count(), 0);
        assert_eq!(read_leases(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_file_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            LeaseStore::open(&path, LockRetry::default()),
            Err(DvpnError::Persistence(_))
        ));
    }
}
