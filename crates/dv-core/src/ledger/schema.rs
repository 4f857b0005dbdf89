//! Versioned account layouts for the dvpn ledger program
//!
//! Every account starts with an 8-byte Anchor discriminator
//! (`sha256("account:<Name>")[..8]`) followed by the fields listed here, in
//! order. Integers are little-endian, strings carry a u32 length prefix.

use std::sync::LazyLock;

use sha2::{Digest, Sha256};

use super::decode::DecodeError;

/// Width of the account discriminator header
pub const DISCRIMINATOR_LEN: usize = 8;

/// Newest program layout this build understands
pub const LATEST_LAYOUT: u16 = 2;

/// Kinds of account the decoder knows how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountKind {
    Provider,
    Node,
    Session,
}

impl AccountKind {
    /// All known kinds, in discriminator lookup order
    pub const ALL: [AccountKind; 3] = [AccountKind::Provider, AccountKind::Node, AccountKind::Session];

    /// Anchor account struct name
    pub fn account_name(&self) -> &'static str {
        match self {
            AccountKind::Provider => "Provider",
            AccountKind::Node => "Node",
            AccountKind::Session => "Session",
        }
    }

    /// Discriminator bytes for this kind
    pub fn discriminator(&self) -> [u8; DISCRIMINATOR_LEN] {
        DISCRIMINATORS
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, disc)| *disc)
            .unwrap_or_default()
    }

    /// Table lookup from discriminator to kind
    pub fn from_discriminator(disc: &[u8]) -> Option<AccountKind> {
        DISCRIMINATORS
            .iter()
            .find(|(_, known)| known.as_slice() == disc)
            .map(|(kind, _)| *kind)
    }
}

impl std::fmt::Display for AccountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.account_name())
    }
}

/// Anchor-style discriminator: first 8 bytes of `sha256("account:<name>")`
pub fn anchor_discriminator(name: &str) -> [u8; DISCRIMINATOR_LEN] {
    let digest = Sha256::digest(format!("account:{}", name).as_bytes());
    let mut out = [0u8; DISCRIMINATOR_LEN];
    out.copy_from_slice(&digest[..DISCRIMINATOR_LEN]);
    out
}

static DISCRIMINATORS: LazyLock<Vec<(AccountKind, [u8; DISCRIMINATOR_LEN])>> = LazyLock::new(|| {
    AccountKind::ALL
        .iter()
        .map(|kind| (*kind, anchor_discriminator(kind.account_name())))
        .collect()
});

/// Wire type of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Pubkey,
    U8,
    U16,
    U32,
    U64,
    I64,
    Bool,
    Bytes32,
    /// u32 length prefix + UTF-8, at most `max_len` payload bytes
    Str { max_len: usize },
    /// One-byte enum tag with `variants` legal values
    Tag { variants: u8 },
}

impl FieldType {
    /// Smallest encoded width
    pub fn min_width(&self) -> usize {
        match self {
            FieldType::Pubkey | FieldType::Bytes32 => 32,
            FieldType::U8 | FieldType::Bool | FieldType::Tag { .. } => 1,
            FieldType::U16 => 2,
            FieldType::U32 => 4,
            FieldType::U64 | FieldType::I64 => 8,
            FieldType::Str { .. } => 4,
        }
    }

    /// Largest encoded width
    pub fn max_width(&self) -> usize {
        match self {
            FieldType::Str { max_len } => 4 + max_len,
            other => other.min_width(),
        }
    }
}

/// One named field of a layout
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn field(name: &'static str, ty: FieldType) -> FieldSpec {
    FieldSpec { name, ty }
}

/// A layout of one account kind at one program version
#[derive(Debug)]
pub struct AccountSchema {
    pub kind: AccountKind,
    pub version: u16,
    pub fields: &'static [FieldSpec],
}

impl AccountSchema {
    /// Minimum account size including the discriminator
    pub fn min_len(&self) -> usize {
        DISCRIMINATOR_LEN + self.fields.iter().map(|f| f.ty.min_width()).sum::<usize>()
    }

    /// Allocated account size including the discriminator
    pub fn max_len(&self) -> usize {
        DISCRIMINATOR_LEN + self.fields.iter().map(|f| f.ty.max_width()).sum::<usize>()
    }
}

const PROVIDER_V1: &[FieldSpec] = &[
    field("authority", FieldType::Pubkey),
    field("node_count", FieldType::U64),
    field("stake_lamports", FieldType::U64),
    field("reputation_score", FieldType::U16),
    field("total_uptime_seconds", FieldType::U64),
    field("total_sessions", FieldType::U64),
    field("total_earnings", FieldType::U64),
    field("bump", FieldType::U8),
];

const NODE_V1: &[FieldSpec] = &[
    field("provider", FieldType::Pubkey),
    field("node_id", FieldType::U64),
    field("endpoint", FieldType::Str { max_len: 80 }),
    field("region", FieldType::Str { max_len: 12 }),
    field("price_per_minute_lamports", FieldType::U64),
    field("wg_server_pubkey", FieldType::Bytes32),
    field("bump", FieldType::U8),
];

const NODE_V2: &[FieldSpec] = &[
    field("provider", FieldType::Pubkey),
    field("node_id", FieldType::U64),
    field("endpoint", FieldType::Str { max_len: 80 }),
    field("region", FieldType::Str { max_len: 12 }),
    field("price_per_minute_lamports", FieldType::U64),
    field("wg_server_pubkey", FieldType::Bytes32),
    field("max_capacity", FieldType::U32),
    field("active_sessions", FieldType::U32),
    field("total_uptime_seconds", FieldType::U64),
    field("total_earnings", FieldType::U64),
    field("is_active", FieldType::Bool),
    field("bandwidth_mbps", FieldType::U32),
    field("quality_score", FieldType::U16),
    field("total_bytes_served", FieldType::U64),
    field("rating_sum", FieldType::U64),
    field("rating_count", FieldType::U32),
    field("bump", FieldType::U8),
];

const SESSION_V1: &[FieldSpec] = &[
    field("user", FieldType::Pubkey),
    field("node", FieldType::Pubkey),
    field("session_id", FieldType::U64),
    field("start_ts", FieldType::I64),
    field("end_ts", FieldType::I64),
    field("escrow_lamports", FieldType::U64),
    field("state", FieldType::Tag { variants: 5 }),
    field("bump", FieldType::U8),
];

const SESSION_V2: &[FieldSpec] = &[
    field("user", FieldType::Pubkey),
    field("node", FieldType::Pubkey),
    field("session_id", FieldType::U64),
    field("start_ts", FieldType::I64),
    field("end_ts", FieldType::I64),
    field("escrow_lamports", FieldType::U64),
    field("remaining_balance", FieldType::U64),
    field("bytes_used", FieldType::U64),
    field("last_proof_hash", FieldType::Bytes32),
    field("payment_token", FieldType::Pubkey),
    field("state", FieldType::Tag { variants: 5 }),
    field("bump", FieldType::U8),
];

/// Every known layout. A kind's layout at program version `n` is the entry
/// with the greatest `version <= n`.
static SCHEMAS: &[AccountSchema] = &[
    AccountSchema { kind: AccountKind::Provider, version: 1, fields: PROVIDER_V1 },
    AccountSchema { kind: AccountKind::Node, version: 1, fields: NODE_V1 },
    AccountSchema { kind: AccountKind::Node, version: 2, fields: NODE_V2 },
    AccountSchema { kind: AccountKind::Session, version: 1, fields: SESSION_V1 },
    AccountSchema { kind: AccountKind::Session, version: 2, fields: SESSION_V2 },
];

/// Resolve the layout of `kind` for a given program layout version
pub fn resolve(kind: AccountKind, layout: u16) -> Result<&'static AccountSchema, DecodeError> {
    if layout == 0 || layout > LATEST_LAYOUT {
        return Err(DecodeError::UnsupportedVersion { kind: kind.account_name(), version: layout });
    }

    SCHEMAS
        .iter()
        .filter(|s| s.kind == kind && s.version <= layout)
        .max_by_key(|s| s.version)
        .ok_or(DecodeError::UnsupportedVersion { kind: kind.account_name(), version: layout })
}
