//! Node broadcast identity
//!
//! The libp2p key a node uses to sign its gossip announcements. It is
//! created on first start and reused afterwards, so peers see a stable
//! sender across restarts. Ledger keys never touch this file.

use libp2p::identity::{Keypair, PeerId};
use std::path::Path;

use crate::error::{DvpnError, Result};

/// Gossip signing key plus the peer id derived from it.
#[derive(Clone)]
pub struct PeerIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl PeerIdentity {
    fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = PeerId::from(keypair.public());
        Self { keypair, peer_id }
    }

    /// Fresh ed25519 identity, not persisted.
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    /// Reuse the identity stored at `path`, writing a new one there on first start.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let identity = Self::generate();
        identity.save(path)?;
        Ok(identity)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Keypair::from_protobuf_encoding(&bytes)
            .map(Self::from_keypair)
            .map_err(|e| DvpnError::Config(format!("unreadable node identity: {e}")))
    }

    /// Written owner-only; anyone holding this key can announce as this node.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let bytes = self
            .keypair
            .to_protobuf_encoding()
            .map_err(|e| DvpnError::Config(format!("cannot encode node identity: {e}")))?;
        std::fs::write(path, bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }
}

impl std::fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerIdentity")
            .field("peer_id", &self.peer_id.to_string())
            .finish()
    }
}
