//! Network Behaviour for DVPN
//!
//! Combines the libp2p protocols node discovery runs on:
//! - Gossipsub: announcement fan-out
//! - Identify: Peer info exchange
//! - Ping: Connection liveness
//! - mDNS: Local network discovery (optional)

use libp2p::{
    gossipsub, identify, mdns, ping,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
};

/// Identify protocol string
pub const IDENTIFY_PROTOCOL: &str = "/dvpn/id/1.0.0";

/// Combined network behaviour for DVPN
#[derive(NetworkBehaviour)]
pub struct DvpnBehaviour {
    /// Announcement topic mesh
    pub gossipsub: gossipsub::Behaviour,
    /// Identify protocol for peer info exchange
    pub identify: identify::Behaviour,
    /// Ping protocol for connection liveness
    pub ping: ping::Behaviour,
    /// mDNS for local network discovery, off unless enabled
    pub mdns: Toggle<mdns::tokio::Behaviour>,
}
