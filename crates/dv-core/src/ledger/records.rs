//! Typed ledger records
//!
//! Each record converts to and from the generic [`Fields`] bag so the schema
//! table stays the only place byte layout is described.

use serde::{Deserialize, Serialize};

use super::decode::{decode_fields, encode_fields, DecodeError, Fields, Value};
use super::schema::{resolve, AccountKind, DISCRIMINATOR_LEN};
use super::Pubkey;

/// A registered tunnel node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAccount {
    pub provider: Pubkey,
    pub node_id: u64,
    pub endpoint: String,
    pub region: String,
    pub price_per_minute_lamports: u64,
    #[serde(with = "super::base64_bytes")]
    pub wg_server_pubkey: [u8; 32],
    pub max_capacity: u32,
    pub active_sessions: u32,
    pub total_uptime_seconds: u64,
    pub total_earnings: u64,
    pub is_active: bool,
    pub bandwidth_mbps: u32,
    pub quality_score: u16,
    pub total_bytes_served: u64,
    pub rating_sum: u64,
    pub rating_count: u32,
    pub bump: u8,
}

impl NodeAccount {
    fn from_fields(f: &Fields) -> Result<Self, DecodeError> {
        Ok(Self {
            provider: f.get("provider")?,
            node_id: f.get("node_id")?,
            endpoint: f.get("endpoint")?,
            region: f.get("region")?,
            price_per_minute_lamports: f.get("price_per_minute_lamports")?,
            wg_server_pubkey: f.get("wg_server_pubkey")?,
            max_capacity: f.opt("max_capacity")?.unwrap_or(0),
            active_sessions: f.opt("active_sessions")?.unwrap_or(0),
            total_uptime_seconds: f.opt("total_uptime_seconds")?.unwrap_or(0),
            total_earnings: f.opt("total_earnings")?.unwrap_or(0),
            // v1 nodes have no activity flag; registration implies active
            is_active: f.opt("is_active")?.unwrap_or(true),
            bandwidth_mbps: f.opt("bandwidth_mbps")?.unwrap_or(0),
            quality_score: f.opt("quality_score")?.unwrap_or(0),
            total_bytes_served: f.opt("total_bytes_served")?.unwrap_or(0),
            rating_sum: f.opt("rating_sum")?.unwrap_or(0),
            rating_count: f.opt("rating_count")?.unwrap_or(0),
            bump: f.get("bump")?,
        })
    }

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("provider", Value::Pubkey(self.provider))
            .with("node_id", Value::U64(self.node_id))
            .with("endpoint", Value::Str(self.endpoint.clone()))
            .with("region", Value::Str(self.region.clone()))
            .with("price_per_minute_lamports", Value::U64(self.price_per_minute_lamports))
            .with("wg_server_pubkey", Value::Bytes32(self.wg_server_pubkey))
            .with("max_capacity", Value::U32(self.max_capacity))
            .with("active_sessions", Value::U32(self.active_sessions))
            .with("total_uptime_seconds", Value::U64(self.total_uptime_seconds))
            .with("total_earnings", Value::U64(self.total_earnings))
            .with("is_active", Value::Bool(self.is_active))
            .with("bandwidth_mbps", Value::U32(self.bandwidth_mbps))
            .with("quality_score", Value::U16(self.quality_score))
            .with("total_bytes_served", Value::U64(self.total_bytes_served))
            .with("rating_sum", Value::U64(self.rating_sum))
            .with("rating_count", Value::U32(self.rating_count))
            .with("bump", Value::U8(self.bump))
    }
}

/// Operator account owning one or more nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAccount {
    pub authority: Pubkey,
    pub node_count: u64,
    pub stake_lamports: u64,
    pub reputation_score: u16,
    pub total_uptime_seconds: u64,
    pub total_sessions: u64,
    pub total_earnings: u64,
    pub bump: u8,
}

impl ProviderAccount {
    fn from_fields(f: &Fields) -> Result<Self, DecodeError> {
        Ok(Self {
            authority: f.get("authority")?,
            node_count: f.get("node_count")?,
            stake_lamports: f.get("stake_lamports")?,
            reputation_score: f.get("reputation_score")?,
            total_uptime_seconds: f.get("total_uptime_seconds")?,
            total_sessions: f.get("total_sessions")?,
            total_earnings: f.get("total_earnings")?,
            bump: f.get("bump")?,
        })
    }

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("authority", Value::Pubkey(self.authority))
            .with("node_count", Value::U64(self.node_count))
            .with("stake_lamports", Value::U64(self.stake_lamports))
            .with("reputation_score", Value::U16(self.reputation_score))
            .with("total_uptime_seconds", Value::U64(self.total_uptime_seconds))
            .with("total_sessions", Value::U64(self.total_sessions))
            .with("total_earnings", Value::U64(self.total_earnings))
            .with("bump", Value::U8(self.bump))
    }
}

/// Session lifecycle as recorded by the program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Active,
    Closed,
    Claimed,
    Disputed,
    Resolved,
}

impl SessionState {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => SessionState::Active,
            1 => SessionState::Closed,
            2 => SessionState::Claimed,
            3 => SessionState::Disputed,
            4 => SessionState::Resolved,
            _ => return None,
        })
    }

    pub fn tag(&self) -> u8 {
        match self {
            SessionState::Active => 0,
            SessionState::Closed => 1,
            SessionState::Claimed => 2,
            SessionState::Disputed => 3,
            SessionState::Resolved => 4,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A paid session between a user and a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAccount {
    pub user: Pubkey,
    pub node: Pubkey,
    pub session_id: u64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub escrow_lamports: u64,
    pub remaining_balance: u64,
    pub bytes_used: u64,
    #[serde(with = "super::base64_bytes")]
    pub last_proof_hash: [u8; 32],
    pub payment_token: Pubkey,
    pub state: SessionState,
    pub bump: u8,
}

impl SessionAccount {
    fn from_fields(f: &Fields) -> Result<Self, DecodeError> {
        let tag: u8 = f.get("state")?;
        let state = SessionState::from_tag(tag)
            .ok_or(DecodeError::InvalidEnumTag { field: "state", value: tag })?;
        Ok(Self {
            user: f.get("user")?,
            node: f.get("node")?,
            session_id: f.get("session_id")?,
            start_ts: f.get("start_ts")?,
            end_ts: f.get("end_ts")?,
            escrow_lamports: f.get("escrow_lamports")?,
            remaining_balance: f.opt("remaining_balance")?.unwrap_or(0),
            bytes_used: f.opt("bytes_used")?.unwrap_or(0),
            last_proof_hash: f.opt("last_proof_hash")?.unwrap_or([0; 32]),
            payment_token: f.opt("payment_token")?.unwrap_or_default(),
            state,
            bump: f.get("bump")?,
        })
    }

    fn to_fields(&self) -> Fields {
        Fields::new()
            .with("user", Value::Pubkey(self.user))
            .with("node", Value::Pubkey(self.node))
            .with("session_id", Value::U64(self.session_id))
            .with("start_ts", Value::I64(self.start_ts))
            .with("end_ts", Value::I64(self.end_ts))
            .with("escrow_lamports", Value::U64(self.escrow_lamports))
            .with("remaining_balance", Value::U64(self.remaining_balance))
            .with("bytes_used", Value::U64(self.bytes_used))
            .with("last_proof_hash", Value::Bytes32(self.last_proof_hash))
            .with("payment_token", Value::Pubkey(self.payment_token))
            .with("state", Value::Tag(self.state.tag()))
            .with("bump", Value::U8(self.bump))
    }
}

/// Any account owned by the program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerAccount {
    Provider(ProviderAccount),
    Node(NodeAccount),
    Session(SessionAccount),
    /// Discriminator not in the table; never guessed at
    Unknown { discriminator: [u8; DISCRIMINATOR_LEN] },
}

impl LedgerAccount {
    pub fn kind_name(&self) -> &'static str {
        match self {
            LedgerAccount::Provider(_) => "Provider",
            LedgerAccount::Node(_) => "Node",
            LedgerAccount::Session(_) => "Session",
            LedgerAccount::Unknown { .. } => "Unknown",
        }
    }
}

/// Decode an account for the given program layout version
pub fn decode_account(data: &[u8], layout: u16) -> Result<LedgerAccount, DecodeError> {
    if data.len() < DISCRIMINATOR_LEN {
        return Err(DecodeError::TooShort {
            kind: "account",
            needed: DISCRIMINATOR_LEN,
            actual: data.len(),
        });
    }

    let mut discriminator = [0u8; DISCRIMINATOR_LEN];
    discriminator.copy_from_slice(&data[..DISCRIMINATOR_LEN]);
    let Some(kind) = AccountKind::from_discriminator(&discriminator) else {
        return Ok(LedgerAccount::Unknown { discriminator });
    };

    let fields = decode_fields(resolve(kind, layout)?, data)?;
    Ok(match kind {
        AccountKind::Provider => LedgerAccount::Provider(ProviderAccount::from_fields(&fields)?),
        AccountKind::Node => LedgerAccount::Node(NodeAccount::from_fields(&fields)?),
        AccountKind::Session => LedgerAccount::Session(SessionAccount::from_fields(&fields)?),
    })
}

/// Encode an account in the given program layout version
///
/// Fields the layout does not carry are dropped.
pub fn encode_account(account: &LedgerAccount, layout: u16) -> Result<Vec<u8>, DecodeError> {
    let (kind, fields) = match account {
        LedgerAccount::Provider(p) => (AccountKind::Provider, p.to_fields()),
        LedgerAccount::Node(n) => (AccountKind::Node, n.to_fields()),
        LedgerAccount::Session(s) => (AccountKind::Session, s.to_fields()),
        LedgerAccount::Unknown { discriminator } => return Ok(discriminator.to_vec()),
    };
    encode_fields(resolve(kind, layout)?, &fields)
}

/// Decode bytes that must be a session account
pub fn decode_session(data: &[u8], layout: u16) -> Result<SessionAccount, DecodeError> {
    match decode_account(data, layout)? {
        LedgerAccount::Session(session) => Ok(session),
        other => Err(DecodeError::UnexpectedKind {
            expected: "Session",
            found: other.kind_name().to_string(),
        }),
    }
}

/// Decode bytes that must be a node account
pub fn decode_node(data: &[u8], layout: u16) -> Result<NodeAccount, DecodeError> {
    match decode_account(data, layout)? {
        LedgerAccount::Node(node) => Ok(node),
        other => Err(DecodeError::UnexpectedKind {
            expected: "Node",
            found: other.kind_name().to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn node(provider: Pubkey, node_id: u64, price: u64) -> NodeAccount {
        NodeAccount {
            provider,
            node_id,
            endpoint: "203.0.113.7:51820".to_string(),
            region: "eu-west".to_string(),
            price_per_minute_lamports: price,
            wg_server_pubkey: [9; 32],
            max_capacity: 100,
            active_sessions: 3,
            total_uptime_seconds: 86_400,
            total_earnings: 5_000_000,
            is_active: true,
            bandwidth_mbps: 500,
            quality_score: 90,
            total_bytes_served: 1 << 30,
            rating_sum: 45,
            rating_count: 10,
            bump: 253,
        }
    }

    pub fn session(user: Pubkey, end_ts: i64, escrow: u64) -> SessionAccount {
        SessionAccount {
            user,
            node: Pubkey::new([2; 32]),
            session_id: 42,
            start_ts: end_ts - 3_600,
            end_ts,
            escrow_lamports: escrow,
            remaining_balance: escrow,
            bytes_used: 0,
            last_proof_hash: [0; 32],
            payment_token: Pubkey::default(),
            state: SessionState::Active,
            bump: 255,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_every_schema_round_trips() {
        let provider = ProviderAccount {
            authority: Pubkey::new([5; 32]),
            node_count: 2,
            stake_lamports: 1_000_000_000,
            reputation_score: 700,
            total_uptime_seconds: 12,
            total_sessions: 4,
            total_earnings: 99,
            bump: 1,
        };
        let mut v1_node = node(Pubkey::new([1; 32]), 8, 100_000);
        v1_node.max_capacity = 0;
        v1_node.active_sessions = 0;
        v1_node.total_uptime_seconds = 0;
        v1_node.total_earnings = 0;
        v1_node.bandwidth_mbps = 0;
        v1_node.quality_score = 0;
        v1_node.total_bytes_served = 0;
        v1_node.rating_sum = 0;
        v1_node.rating_count = 0;
        let mut v1_session = session(Pubkey::new([3; 32]), 10_000, 2_000);
        v1_session.remaining_balance = 0;
        let mut v2_session = v1_session.clone();
        v2_session.remaining_balance = 1_500;
        v2_session.bytes_used = 4096;
        v2_session.last_proof_hash = [7; 32];
        v2_session.payment_token = Pubkey::new([8; 32]);
        v2_session.state = SessionState::Disputed;

        let cases = [
            (LedgerAccount::Provider(provider), 1),
            (LedgerAccount::Node(v1_node), 1),
            (LedgerAccount::Node(node(Pubkey::new([1; 32]), 9, 1)), 2),
            (LedgerAccount::Session(v1_session), 1),
            (LedgerAccount::Session(v2_session), 2),
        ];
        for (account, layout) in cases {
            let bytes = encode_account(&account, layout).unwrap();
            assert_eq!(decode_account(&bytes, layout).unwrap(), account, "layout {layout}");
        }
    }

    #[test]
    fn test_unknown_discriminator_is_explicit() {
        let mut bytes = vec![0xAB; 8];
        bytes.extend_from_slice(&[0; 100]);
        assert_eq!(
            decode_account(&bytes, 2).unwrap(),
            LedgerAccount::Unknown { discriminator: [0xAB; 8] }
        );
    }

    #[test]
    fn test_v2_session_read_with_v1_layout_is_rejected() {
        let mut s = session(Pubkey::new([3; 32]), 10_000, 2_000);
        s.remaining_balance = 0;
        s.payment_token = Pubkey::new([8; 32]);
        let bytes = encode_account(&LedgerAccount::Session(s), 2).unwrap();
        // The v2 tail lands where v1 expects zero padding
        assert!(matches!(
            decode_account(&bytes, 1),
            Err(DecodeError::LayoutMismatch { kind: "Session", .. })
        ));
    }

    #[test]
    fn test_v1_node_defaults_to_active() {
        let n = node(Pubkey::new([1; 32]), 1, 10);
        let bytes = encode_account(&LedgerAccount::Node(n), 1).unwrap();
        let decoded = decode_node(&bytes, 1).unwrap();
        assert!(decoded.is_active);
        assert_eq!(decoded.max_capacity, 0);
    }

    #[test]
    fn test_inactive_flag_is_honoured_in_v2() {
        let mut n = node(Pubkey::new([1; 32]), 1, 10);
        n.is_active = false;
        let bytes = encode_account(&LedgerAccount::Node(n), 2).unwrap();
        assert!(!decode_node(&bytes, 2).unwrap().is_active);
    }

    #[test]
    fn test_bad_bool_byte_rejected() {
        let n = node(Pubkey::new([1; 32]), 1, 10);
        let mut bytes = encode_account(&LedgerAccount::Node(n.clone()), 2).unwrap();
        // is_active offset: disc + provider + node_id + endpoint + region + price + key + 4 u32/u64s
        let offset = 8 + 32 + 8 + (4 + n.endpoint.len()) + (4 + n.region.len()) + 8 + 32 + 4 + 4 + 8 + 8;
        bytes[offset] = 2;
        assert_eq!(
            decode_account(&bytes, 2).unwrap_err(),
            DecodeError::InvalidBool { field: "is_active", value: 2 }
        );
    }

    #[test]
    fn test_decode_session_rejects_node_bytes() {
        let bytes = encode_account(&LedgerAccount::Node(node(Pubkey::new([1; 32]), 1, 10)), 2).unwrap();
        assert!(matches!(
            decode_session(&bytes, 2),
            Err(DecodeError::UnexpectedKind { expected: "Session", .. })
        ));
    }
}
