//! DVPN Core Library
//!
//! This crate provides the node-side logic of a ledger-paid WireGuard network.
//! It includes:
//! - Versioned decoding of the ledger program's accounts
//! - Node discovery merging the ledger with gossip announcements
//! - Session verification and peer authorization against the tunnel daemon
//! - The expiry reaper that retires ended sessions

pub mod authorizer;
pub mod brand;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod lease;
pub mod ledger;
pub mod locks;
pub mod network;
pub mod protocol;
pub mod reaper;
pub mod session;
pub mod tunnel;

pub use authorizer::{AuthorizeRequest, ClientTunnelConfig, Grant, PeerAuthorizer, RevokeOutcome, ServerPeerInfo};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DvpnConfig;
pub use crypto::{AddressPool, TunnelKey, TunnelKeyPair};
pub use discovery::{DiscoveryAggregator, NodeCache, NodeFilter, NodeKey, NodeRecord, Provenance};
pub use error::{DvpnError, Result};
pub use lease::{LeaseStore, PeerLease};
pub use ledger::{LedgerAccount, LedgerClient, Pubkey, SessionAccount, SessionState};
pub use locks::SessionLocks;
pub use network::{NetworkEvent, PeerNetwork};
pub use protocol::Announcement;
pub use reaper::{ExpiryReaper, SweepReport};
pub use session::{SessionVerifier, VerifiedSession};
pub use tunnel::TunnelControl;

// Re-export libp2p types we expose
pub use libp2p::{Multiaddr, PeerId};
