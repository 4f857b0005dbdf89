//! Branding Constants
//!
//! Single source of truth for product naming and branding.

/// Product display name
pub const PRODUCT_NAME: &str = "DVPN";

/// Binary executable name
pub const BIN_NAME: &str = "dvpn";

/// Short description
pub const DESCRIPTION: &str = "Ledger-paid WireGuard node daemon";

/// Agent string sent by libp2p identify
pub fn agent_version() -> String {
    format!("{}/{}", BIN_NAME, env!("CARGO_PKG_VERSION"))
}
