//! Error types for DVPN
//!
//! Provides a unified error handling strategy using thiserror.

use thiserror::Error;

use crate::ledger::DecodeError;

/// Result type alias for DVPN operations
pub type Result<T> = std::result::Result<T, DvpnError>;

/// Unified error type for all DVPN operations
#[derive(Error, Debug)]
pub enum DvpnError {
    // ─────────────────────────────────────────────────────────────
    // Ledger Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to decode ledger account: {0}")]
    Decode(#[from] DecodeError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    // ─────────────────────────────────────────────────────────────
    // Session Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Session owner mismatch: expected {expected}, session belongs to {actual}")]
    OwnerMismatch { expected: String, actual: String },

    #[error("Session expired at {end_ts} (now {now})")]
    Expired { end_ts: i64, now: i64 },

    #[error("Session underfunded: escrow {escrow} below floor {floor}")]
    Underfunded { escrow: u64, floor: u64 },

    #[error("Session is not active (state: {0})")]
    SessionInactive(String),

    // ─────────────────────────────────────────────────────────────
    // Authorization Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid tunnel key: {0}")]
    InvalidTunnelKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Session {0} is busy, retry shortly")]
    Busy(String),

    #[error("Address {address} is already leased to another tunnel key")]
    AddressConflict { address: String },

    // ─────────────────────────────────────────────────────────────
    // Tunnel / Persistence Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Tunnel daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    // ─────────────────────────────────────────────────────────────
    // Configuration / Network Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to initialize P2P network: {0}")]
    NetworkInitialization(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DvpnError {
    /// Stable machine-readable code, used by the request surface
    pub fn code(&self) -> &'static str {
        match self {
            DvpnError::Decode(_) => "decode_error",
            DvpnError::NotFound(_) => "not_found",
            DvpnError::LedgerUnavailable(_) => "ledger_unavailable",
            DvpnError::OwnerMismatch { .. } => "owner_mismatch",
            DvpnError::Expired { .. } => "expired",
            DvpnError::Underfunded { .. } => "underfunded",
            DvpnError::SessionInactive(_) => "session_inactive",
            DvpnError::InvalidSignature(_) => "invalid_signature",
            DvpnError::InvalidTunnelKey(_) => "invalid_tunnel_key",
            DvpnError::InvalidAddress(_) => "invalid_address",
            DvpnError::Busy(_) => "busy",
            DvpnError::AddressConflict { .. } => "address_conflict",
            DvpnError::DaemonUnavailable(_) => "daemon_unavailable",
            DvpnError::Persistence(_) => "persistence_error",
            DvpnError::Config(_) => "config_error",
            DvpnError::NetworkInitialization(_) => "network_error",
            DvpnError::Io(_) => "io_error",
            DvpnError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for DvpnError {
    fn from(err: serde_json::Error) -> Self {
        DvpnError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for DvpnError {
    fn from(err: bincode::Error) -> Self {
        DvpnError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for DvpnError {
    fn from(err: reqwest::Error) -> Self {
        DvpnError::LedgerUnavailable(err.to_string())
    }
}

impl From<toml::de::Error> for DvpnError {
    fn from(err: toml::de::Error) -> Self {
        DvpnError::Config(err.to_string())
    }
}
