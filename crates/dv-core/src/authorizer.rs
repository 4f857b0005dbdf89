//! Peer authorization
//!
//! Per session: `Unauthorized -> Authorized -> Revoked`, and back to
//! `Authorized` if a still-valid session is authorized again. Every step of a
//! grant after verification runs under the session guard.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::{parse_signature, verify_owner_signature, AddressPool, TunnelKey};
use crate::error::{DvpnError, Result};
use crate::lease::{LeaseStore, PeerLease};
use crate::ledger::Pubkey;
use crate::locks::SessionLocks;
use crate::session::SessionVerifier;
use crate::tunnel::{self, RetryPolicy, TunnelControl};

/// Body of an authorization request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    /// Session account address (base58)
    #[serde(alias = "sessionPda")]
    pub session_id: String,
    /// Client tunnel public key (base64)
    #[serde(alias = "clientWgPubkey")]
    pub client_tunnel_key: String,
    /// Owner's signature over the key text (base58 or base64)
    pub signature: String,
}

/// `[Interface]` part of the client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSection {
    pub address: String,
}

/// `[Peer]` part of the client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSection {
    pub public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    pub persistent_keepalive: u16,
}

/// Tunnel configuration handed back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTunnelConfig {
    pub interface: InterfaceSection,
    pub peer: PeerSection,
}

impl ClientTunnelConfig {
    /// Render as a wg-quick file; the client supplies its own private key
    pub fn to_wg_quick(&self) -> String {
        format!(
            "[Interface]\nAddress = {}\n\n[Peer]\nPublicKey = {}\nEndpoint = {}\nAllowedIPs = {}\nPersistentKeepalive = {}\n",
            self.interface.address,
            self.peer.public_key,
            self.peer.endpoint,
            self.peer.allowed_ips,
            self.peer.persistent_keepalive
        )
    }
}

/// This node as clients should dial it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPeerInfo {
    pub public_key: TunnelKey,
    pub endpoint: String,
}

/// A successful authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub session: Pubkey,
    pub allocated_address: Ipv4Addr,
    pub client_config: ClientTunnelConfig,
    /// An existing live lease was returned unchanged
    pub reused: bool,
    /// The lease reached disk; false means it is parked for the reaper
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked(PeerLease),
    NotLeased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LeaseState {
    Unauthorized,
    Authorized,
    Revoked,
}

/// Tunnel parameters for granted peers
#[derive(Debug, Clone, Copy)]
pub struct AuthorizerSettings {
    pub pool: AddressPool,
    pub keepalive_secs: u16,
    pub retry: RetryPolicy,
}

/// Turns verified sessions into tunnel peers
pub struct PeerAuthorizer {
    verifier: Arc<SessionVerifier>,
    tunnel: Arc<dyn TunnelControl>,
    leases: Arc<LeaseStore>,
    locks: SessionLocks,
    settings: AuthorizerSettings,
    /// Unset for a cleanup-only authorizer, which never grants
    server: Option<ServerPeerInfo>,
    revoked: RwLock<HashSet<Pubkey>>,
}

impl PeerAuthorizer {
    pub fn new(
        verifier: Arc<SessionVerifier>,
        tunnel: Arc<dyn TunnelControl>,
        leases: Arc<LeaseStore>,
        locks: SessionLocks,
        settings: AuthorizerSettings,
        server: ServerPeerInfo,
    ) -> Self {
        Self {
            verifier,
            tunnel,
            leases,
            locks,
            settings,
            server: Some(server),
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// An authorizer that can revoke and be swept but refuses to grant
    pub fn cleanup_only(
        verifier: Arc<SessionVerifier>,
        tunnel: Arc<dyn TunnelControl>,
        leases: Arc<LeaseStore>,
        locks: SessionLocks,
        settings: AuthorizerSettings,
    ) -> Self {
        Self {
            verifier,
            tunnel,
            leases,
            locks,
            settings,
            server: None,
            revoked: RwLock::new(HashSet::new()),
        }
    }

    pub fn leases(&self) -> &Arc<LeaseStore> {
        &self.leases
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    pub fn settings(&self) -> &AuthorizerSettings {
        &self.settings
    }

    pub fn state(&self, session: &Pubkey) -> LeaseState {
        if self.leases.get(session).is_some() {
            LeaseState::Authorized
        } else if self.revoked.read().contains(session) {
            LeaseState::Revoked
        } else {
            LeaseState::Unauthorized
        }
    }

    fn client_config(&self, server: &ServerPeerInfo, address: Ipv4Addr) -> ClientTunnelConfig {
        ClientTunnelConfig {
            interface: InterfaceSection { address: format!("{}/32", address) },
            peer: PeerSection {
                public_key: server.public_key.to_base64(),
                endpoint: server.endpoint.clone(),
                allowed_ips: "0.0.0.0/0".to_string(),
                persistent_keepalive: self.settings.keepalive_secs,
            },
        }
    }

    fn grant(&self, server: &ServerPeerInfo, session: Pubkey, address: Ipv4Addr, reused: bool, persisted: bool) -> Grant {
        Grant {
            session,
            allocated_address: address,
            client_config: self.client_config(server, address),
            reused,
            persisted,
        }
    }

    /// Authorize a tunnel key for a session
    pub async fn authorize(&self, request: &AuthorizeRequest) -> Result<Grant> {
        let session: Pubkey = request.session_id.parse()?;
        let key_text = request.client_tunnel_key.trim();
        let key: TunnelKey = key_text.parse()?;
        let signature = parse_signature(&request.signature)?;
        let server = self
            .server
            .as_ref()
            .ok_or_else(|| DvpnError::Config("no tunnel server peer configured".to_string()))?;

        let verified = self.verifier.check_address(&session).await?;
        let owner = verified.session.user;
        verify_owner_signature(&owner, key_text, &signature)?;

        let mut guard = self
            .locks
            .try_acquire(session)
            .ok_or_else(|| DvpnError::Busy(session.to_string()))?;
        let policy = self.settings.retry;

        if let Some(existing) = self.leases.get(&session) {
            if existing.client_tunnel_key == key {
                if tunnel::has_peer(self.tunnel.as_ref(), &key, &policy).await? {
                    info!(session = %session, address = %existing.allocated_address, "Reusing live lease");
                    let persisted = self.leases.is_committed(&session);
                    return Ok(self.grant(server, session, existing.allocated_address, true, persisted));
                }
                warn!(session = %session, "Leased peer missing from tunnel, provisioning again");
            } else if !self.key_shared(&session, &existing.client_tunnel_key) {
                info!(session = %session, old = %existing.client_tunnel_key, "Replacing leased tunnel key");
                guard.mark_in_flight(existing.client_tunnel_key);
                tunnel::remove_peer(self.tunnel.as_ref(), &existing.client_tunnel_key, &policy).await?;
            }
        }

        let address = self.settings.pool.allocate(&key);
        // Held until the lease commits, so no other session can pass the
        // holder check for this address meanwhile
        if !guard.claim_address(address) {
            let claimant = self.locks.claimant(&address).map(|c| c.to_string()).unwrap_or_default();
            warn!(session = %session, %address, claimant = %claimant, "Derived address claimed by a grant in progress");
            return Err(DvpnError::AddressConflict { address: address.to_string() });
        }
        let mut transferred = Vec::new();
        if let Some((holder, held)) = self.leases.holder_of(address) {
            if holder != session {
                if held.client_tunnel_key == key && held.owner == owner {
                    // Same owner moving a key to a new session
                    transferred.push(holder);
                } else {
                    warn!(session = %session, %address, holder = %holder, "Derived address already leased");
                    return Err(DvpnError::AddressConflict { address: address.to_string() });
                }
            }
        }

        guard.mark_in_flight(key);
        tunnel::ensure_peer(self.tunnel.as_ref(), &key, address, self.settings.keepalive_secs, &policy).await?;

        let lease = PeerLease {
            client_tunnel_key: key,
            allocated_address: address,
            owner,
            created_at: self.verifier.clock().now(),
        };
        let persisted = match self.leases.commit(&[(session, lease.clone())], &transferred).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session = %session, %address, "Peer provisioned but lease not persisted: {}", e);
                self.leases.park_pending(session, lease);
                false
            }
        };

        self.revoked.write().remove(&session);
        info!(session = %session, %address, persisted, "Authorized tunnel peer");
        Ok(self.grant(server, session, address, false, persisted))
    }

    /// Whether a lease other than `session`'s uses `key`
    fn key_shared(&self, session: &Pubkey, key: &TunnelKey) -> bool {
        self.leases
            .snapshot()
            .iter()
            .any(|(s, l)| s != session && l.client_tunnel_key == *key)
    }

    /// Remove a session's peer and lease
    pub async fn revoke(&self, session: &Pubkey) -> Result<RevokeOutcome> {
        let _guard = self
            .locks
            .try_acquire(*session)
            .ok_or_else(|| DvpnError::Busy(session.to_string()))?;

        let Some(lease) = self.leases.get(session) else {
            return Ok(RevokeOutcome::NotLeased);
        };

        if !self.key_shared(session, &lease.client_tunnel_key) {
            tunnel::remove_peer(self.tunnel.as_ref(), &lease.client_tunnel_key, &self.settings.retry).await?;
        }
        self.leases.remove(session).await?;
        self.revoked.write().insert(*session);

        info!(session = %session, address = %lease.allocated_address, "Revoked tunnel peer");
        Ok(RevokeOutcome::Revoked(lease))
    }

    /// Record an out-of-band revocation (used by the reaper)
    pub(crate) fn mark_revoked(&self, session: Pubkey) {
        self.revoked.write().insert(session);
    }

    pub(crate) fn revoked_sessions(&self) -> Vec<Pubkey> {
        self.revoked.read().iter().copied().collect()
    }

    /// Forget a revocation once the session account is gone for good
    pub(crate) fn forget_revoked(&self, session: &Pubkey) {
        self.revoked.write().remove(session);
    }

    pub(crate) fn tunnel(&self) -> &Arc<dyn TunnelControl> {
        &self.tunnel
    }

    pub(crate) fn verifier(&self) -> &Arc<SessionVerifier> {
        &self.verifier
    }
}
