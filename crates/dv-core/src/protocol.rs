//! DVPN Broadcast Protocol
//!
//! Nodes advertise themselves on a gossipsub topic. Announcements are
//! unauthenticated hints: the discovery cache ranks them below anything the
//! ledger says.

use serde::{Deserialize, Serialize};

use crate::ledger::{NodeAccount, Pubkey};

/// Gossipsub topic carrying node announcements
pub const ANNOUNCE_TOPIC: &str = "dvpn-nodes-v1";

/// Current announcement format
pub const ANNOUNCEMENT_VERSION: u16 = 1;

/// Largest announcement accepted off the wire
pub const MAX_ANNOUNCEMENT_BYTES: usize = 1024;

const MAX_ENDPOINT_LEN: usize = 80;
const MAX_REGION_LEN: usize = 12;

/// Why an announcement was dropped
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnouncementError {
    #[error("announcement of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("undecodable announcement: {0}")]
    Malformed(String),
    #[error("unsupported announcement version {0}")]
    UnsupportedVersion(u16),
    #[error("invalid field `{0}`")]
    InvalidField(&'static str),
}

/// One node's self-description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub version: u16,

    /// Provider account operating the node
    pub operator: Pubkey,

    pub node_id: u64,

    /// Node account address, when the node knows it
    pub node_address: Option<Pubkey>,

    /// `host:port` of the tunnel endpoint
    pub endpoint: String,

    pub region: String,

    pub price_per_minute: u64,

    pub max_capacity: u32,

    /// Tunnel server public key
    pub tunnel_pubkey: [u8; 32],

    /// Unix seconds at which the announcement was made
    pub timestamp: i64,
}

impl Announcement {
    /// Announcement mirroring a node's ledger account
    pub fn from_node(node: &NodeAccount, node_address: Option<Pubkey>, timestamp: i64) -> Self {
        Self {
            version: ANNOUNCEMENT_VERSION,
            operator: node.provider,
            node_id: node.node_id,
            node_address,
            endpoint: node.endpoint.clone(),
            region: node.region.clone(),
            price_per_minute: node.price_per_minute_lamports,
            max_capacity: node.max_capacity,
            tunnel_pubkey: node.wg_server_pubkey,
            timestamp,
        }
    }

    /// Serialize announcement to bytes using bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize and validate an announcement
    pub fn from_bytes(data: &[u8]) -> Result<Self, AnnouncementError> {
        if data.len() > MAX_ANNOUNCEMENT_BYTES {
            return Err(AnnouncementError::TooLarge(data.len()));
        }
        let announcement: Announcement =
            bincode::deserialize(data).map_err(|e| AnnouncementError::Malformed(e.to_string()))?;
        announcement.validate()?;
        Ok(announcement)
    }

    pub fn validate(&self) -> Result<(), AnnouncementError> {
        if self.version != ANNOUNCEMENT_VERSION {
            return Err(AnnouncementError::UnsupportedVersion(self.version));
        }
        if self.endpoint.is_empty() || self.endpoint.len() > MAX_ENDPOINT_LEN || !self.endpoint.contains(':') {
            return Err(AnnouncementError::InvalidField("endpoint"));
        }
        if self.region.len() > MAX_REGION_LEN {
            return Err(AnnouncementError::InvalidField("region"));
        }
        if self.tunnel_pubkey == [0; 32] {
            return Err(AnnouncementError::InvalidField("tunnel_pubkey"));
        }
        Ok(())
    }
}
