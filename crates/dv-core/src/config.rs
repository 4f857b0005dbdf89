//! Configuration management for DVPN
//!
//! Handles loading and saving of the daemon configuration: ledger endpoint,
//! discovery knobs, tunnel interface, lease state location and the request
//! surface.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::authorizer::{AuthorizerSettings, ServerPeerInfo};
use crate::crypto::{AddressPool, TunnelKey};
use crate::error::{DvpnError, Result};
use crate::lease::LockRetry;
use crate::ledger::{Pubkey, LATEST_LAYOUT};
use crate::tunnel::RetryPolicy;

/// Program id of the deployed dvpn ledger program
pub const DEFAULT_PROGRAM_ID: &str = "EYDWvx95gq6GhniDGHMHbn6DsigFhcWGHvHgbbxzuqQq";

/// Main configuration for DVPN
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DvpnConfig {
    pub ledger: LedgerConfig,
    pub discovery: DiscoveryConfig,
    pub tunnel: TunnelConfig,
    pub session: SessionConfig,
    pub state: StateConfig,
    pub server: ServerConfig,
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Solana JSON-RPC endpoint
    pub rpc_url: String,

    pub program_id: String,

    /// Program layout version used to decode accounts
    pub layout_version: u16,

    /// Minimum seconds between ledger node refreshes
    pub cache_ttl_secs: u64,

    pub read_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.testnet.solana.com".to_string(),
            program_id: DEFAULT_PROGRAM_ID.to_string(),
            layout_version: LATEST_LAYOUT,
            cache_ttl_secs: 60,
            read_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Seconds an announcement stays current
    pub freshness_secs: u64,

    /// Seconds between our own announcements
    pub announce_interval_secs: u64,

    /// Port for the local QUIC listener (0 = random)
    pub listen_port: u16,

    /// Join the gossip network at all
    pub enable_gossip: bool,

    /// Enable mDNS for local network peer discovery
    pub enable_mdns: bool,

    /// Multiaddrs dialed at startup
    pub bootstrap_peers: Vec<String>,

    /// Path to the libp2p identity keypair file
    pub identity_path: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 300,
            announce_interval_secs: 30,
            listen_port: 0,
            enable_gossip: true,
            enable_mdns: true,
            bootstrap_peers: Vec::new(),
            identity_path: DvpnConfig::default_config_dir().join("identity.key"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub interface: String,

    /// Run `wg` through sudo
    pub use_sudo: bool,

    pub address_pool: String,

    /// Low host numbers never handed out (gateway and friends)
    pub reserved_low: u32,

    pub keepalive_secs: u16,

    pub command_timeout_secs: u64,

    pub attempts: u32,

    pub backoff_ms: u64,

    /// This node's tunnel public key (base64), used when the ledger node
    /// account cannot be read
    pub server_public_key: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".to_string(),
            use_sudo: true,
            address_pool: "10.10.0.0/24".to_string(),
            reserved_low: 4,
            keepalive_secs: 25,
            command_timeout_secs: 5,
            attempts: 3,
            backoff_ms: 100,
            server_public_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Smallest escrow, in lamports, a usable session may hold
    pub funding_floor: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { funding_floor: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub dir: PathBuf,
    pub lock_retries: u32,
    pub lock_base_ms: u64,
    pub lock_factor: u32,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dvpn"),
            lock_retries: 5,
            lock_base_ms: 50,
            lock_factor: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,

    /// This daemon's node account address (base58)
    pub node_address: Option<String>,

    /// Public `host:port` clients dial, used when the ledger is unreachable
    pub endpoint: Option<String>,

    pub region: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            node_address: None,
            endpoint: None,
            region: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_secs: u64,
    /// Log intended revocations without acting on them
    pub dry_run: bool,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            dry_run: false,
        }
    }
}

impl DvpnConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Loads the file if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Saves configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| DvpnError::Config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Returns the default configuration directory
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dvpn")
    }

    /// Returns the default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Apply overrides from the process environment
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn number<T: std::str::FromStr>(name: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| DvpnError::Config(format!("{} must be a number, got {:?}", name, value)))
        }

        if let Some(url) = lookup("DVPN_RPC_URL").or_else(|| lookup("ANCHOR_PROVIDER_URL")) {
            self.ledger.rpc_url = url;
        }
        if let Some(interface) = lookup("WG_INTERFACE") {
            self.tunnel.interface = interface;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = number("PORT", port)?;
        }
        if let Some(ms) = lookup("CLEANUP_INTERVAL_MS") {
            let ms: u64 = number("CLEANUP_INTERVAL_MS", ms)?;
            self.reaper.interval_secs = (ms / 1000).max(1);
        }
        if let Some(dir) = lookup("DVPN_STATE_DIR") {
            self.state.dir = PathBuf::from(dir);
        }
        if let Some(floor) = lookup("DVPN_FUNDING_FLOOR") {
            self.session.funding_floor = number("DVPN_FUNDING_FLOOR", floor)?;
        }
        if let Some(flag) = lookup("DRY_RUN") {
            self.reaper.dry_run = flag.trim() == "1";
        }
        Ok(self)
    }

    /// Builder pattern: set ledger endpoint
    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.ledger.rpc_url = url.into();
        self
    }

    /// Builder pattern: set state directory
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state.dir = dir.into();
        self
    }

    /// Builder pattern: set HTTP bind address
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.server.bind = bind.into();
        self
    }

    /// Builder pattern: set HTTP port
    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    /// Builder pattern: set funding floor
    pub fn with_funding_floor(mut self, floor: u64) -> Self {
        self.session.funding_floor = floor;
        self
    }

    /// Builder pattern: enable/disable the gossip network
    pub fn with_gossip(mut self, enable: bool) -> Self {
        self.discovery.enable_gossip = enable;
        self
    }

    /// Builder pattern: enable/disable mDNS
    pub fn with_mdns(mut self, enable: bool) -> Self {
        self.discovery.enable_mdns = enable;
        self
    }

    /// Lease file location
    pub fn leases_path(&self) -> PathBuf {
        self.state.dir.join("peers.json")
    }

    pub fn program_id(&self) -> Result<Pubkey> {
        self.ledger
            .program_id
            .parse()
            .map_err(|e| DvpnError::Config(format!("ledger.program_id: {}", e)))
    }

    pub fn node_address(&self) -> Result<Option<Pubkey>> {
        self.server
            .node_address
            .as_deref()
            .map(|s| s.parse().map_err(|e| DvpnError::Config(format!("server.node_address: {}", e))))
            .transpose()
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger.read_timeout_secs)
    }

    pub fn lock_retry(&self) -> LockRetry {
        LockRetry {
            retries: self.state.lock_retries,
            base: Duration::from_millis(self.state.lock_base_ms),
            factor: self.state.lock_factor.max(1),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.tunnel.attempts.max(1),
            backoff: Duration::from_millis(self.tunnel.backoff_ms),
            call_timeout: Duration::from_secs(self.tunnel.command_timeout_secs),
        }
    }

    pub fn authorizer_settings(&self) -> Result<AuthorizerSettings> {
        Ok(AuthorizerSettings {
            pool: AddressPool::new(&self.tunnel.address_pool, self.tunnel.reserved_low)?,
            keepalive_secs: self.tunnel.keepalive_secs,
            retry: self.retry_policy(),
        })
    }

    /// Server peer details from configuration alone
    pub fn configured_server_peer(&self) -> Result<ServerPeerInfo> {
        let key = self
            .tunnel
            .server_public_key
            .as_deref()
            .ok_or_else(|| DvpnError::Config("tunnel.server_public_key is not set".to_string()))?;
        let endpoint = self
            .server
            .endpoint
            .clone()
            .ok_or_else(|| DvpnError::Config("server.endpoint is not set".to_string()))?;
        Ok(ServerPeerInfo {
            public_key: key.parse::<TunnelKey>()?,
            endpoint,
        })
    }

    /// Reject settings that cannot work before anything starts
    pub fn validate(&self) -> Result<()> {
        self.program_id()?;
        self.node_address()?;
        AddressPool::new(&self.tunnel.address_pool, self.tunnel.reserved_low)?;
        if self.ledger.layout_version == 0 || self.ledger.layout_version > LATEST_LAYOUT {
            return Err(DvpnError::Config(format!(
                "ledger.layout_version {} unsupported (1..={})",
                self.ledger.layout_version, LATEST_LAYOUT
            )));
        }
        if self.reaper.interval_secs == 0 {
            return Err(DvpnError::Config("reaper.interval_secs must be positive".to_string()));
        }
        Ok(())
    }
}
