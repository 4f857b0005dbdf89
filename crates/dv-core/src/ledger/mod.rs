//! Ledger access and account decoding
//!
//! The core only ever reads the ledger. [`LedgerClient`] is the collaborator
//! seam; [`rpc::RpcLedger`] talks to a Solana JSON-RPC endpoint and
//! [`memory::MemoryLedger`] backs tests and offline runs.

pub mod decode;
pub mod memory;
pub mod records;
pub mod rpc;
pub mod schema;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DvpnError, Result};

pub use decode::DecodeError;
pub use records::{
    decode_account, decode_node, decode_session, encode_account, LedgerAccount, NodeAccount,
    ProviderAccount, SessionAccount, SessionState,
};
pub use schema::{AccountKind, LATEST_LAYOUT};

/// 32-byte ledger address, displayed as base58
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({})", self)
    }
}

impl FromStr for Pubkey {
    type Err = DvpnError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|e| DvpnError::InvalidAddress(format!("{}: {}", s, e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| DvpnError::InvalidAddress(format!("{}: {} bytes, expected 32", s, v.len())))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// serde helper rendering 32-byte blobs as base64 strings
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Read-only view of the ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Raw account data, `None` when the account does not exist
    async fn read_account(&self, address: &Pubkey) -> Result<Option<Bytes>>;

    /// Every program account whose data starts with `discriminator`
    async fn list_accounts(&self, discriminator: &[u8; 8]) -> Result<Vec<(Pubkey, Bytes)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pubkey_base58_round_trip() {
        let key = Pubkey::new([7; 32]);
        let text = key.to_string();
        assert_eq!(text.parse::<Pubkey>().unwrap(), key);
        assert_eq!(serde_json::to_string(&key).unwrap(), format!("\"{}\"", text));
    }

    #[test]
    fn test_pubkey_rejects_wrong_length() {
        let short = bs58::encode([1u8; 16]).into_string();
        assert!(matches!(short.parse::<Pubkey>(), Err(DvpnError::InvalidAddress(_))));
        assert!("not-base58!".parse::<Pubkey>().is_err());
    }
}
