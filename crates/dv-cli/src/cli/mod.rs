//! CLI Command Definitions
//!
//! Defines the command-line interface using clap.

pub mod info;
pub mod init;
pub mod keygen;
pub mod nodes;
pub mod serve;
pub mod session;
pub mod sweep;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dv_core::discovery::Provenance;
use dv_core::DvpnConfig;
use std::path::{Path, PathBuf};

/// dvpn - session authorization for a ledger-paid VPN
///
/// Checks paid sessions on the ledger, provisions tunnel peers for their
/// owners and revokes them when the session ends.
#[derive(Parser, Debug)]
#[command(name = "dvpn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, env = "DVPN_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(DvpnConfig::default_config_path)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon
    ///
    /// Serves the HTTP request surface, joins the node broadcast channel
    /// and sweeps expired sessions on a timer.
    #[command(visible_alias = "s")]
    Serve {
        /// Timer sweeps report what they would revoke without revoking
        #[arg(long)]
        dry_run: bool,
    },

    /// Run one cleanup pass and exit
    #[command(alias = "cleanup-now")]
    Sweep {
        /// Report only; the lease file and interface are left untouched
        #[arg(long)]
        dry_run: bool,
    },

    /// List known tunnel nodes from the ledger
    #[command(visible_alias = "n")]
    Nodes {
        /// Case-insensitive region substring
        #[arg(short, long)]
        region: Option<String>,

        /// Minimum provenance: announced, ledger or ledger+announced
        #[arg(long, value_name = "LEVEL")]
        min_trust: Option<Provenance>,

        /// Include nodes seen only on the broadcast channel
        #[arg(long)]
        include_unverified: bool,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show a session account and its lease
    Session {
        /// Session account address (base58)
        #[arg(value_name = "SESSION")]
        id: String,

        /// Also check the session against this owner
        #[arg(long, value_name = "PUBKEY")]
        owner: Option<String>,
    },

    /// Show local configuration and state
    #[command(visible_alias = "i")]
    Info,

    /// Generate a tunnel key pair
    Keygen,

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// File config with environment overrides on top
pub fn load_config(path: &Path) -> Result<DvpnConfig> {
    let config = DvpnConfig::load_or_default(path)
        .with_context(|| format!("reading {}", path.display()))?
        .apply_env()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_now_is_sweep() {
        let cli = Cli::try_parse_from(["dvpn", "cleanup-now", "--dry-run"]).unwrap();
        assert!(matches!(cli.command, Commands::Sweep { dry_run: true }));
    }

    #[test]
    fn test_nodes_trust_level_parses() {
        let cli = Cli::try_parse_from(["dvpn", "nodes", "--min-trust", "ledger", "-r", "eu"]).unwrap();
        match cli.command {
            Commands::Nodes { region, min_trust, .. } => {
                assert_eq!(region.as_deref(), Some("eu"));
                assert_eq!(min_trust, Some(Provenance::Ledger));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let cli = Cli::try_parse_from(["dvpn", "--config", "/tmp/dvpn.toml", "info"]).unwrap();
        assert_eq!(cli.config_path(), PathBuf::from("/tmp/dvpn.toml"));
    }
}
