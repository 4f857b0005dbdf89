//! dvpn CLI
//!
//! Command-line interface for the dvpn session-authorization daemon.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // .env before anything reads the environment
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config_path = cli.config_path();
    match cli.command {
        Commands::Serve { dry_run } => {
            cli::serve::run(&config_path, dry_run).await?;
        }
        Commands::Sweep { dry_run } => {
            cli::sweep::run(&config_path, dry_run).await?;
        }
        Commands::Nodes { region, min_trust, include_unverified, json } => {
            cli::nodes::run(&config_path, region, min_trust, include_unverified, json).await?;
        }
        Commands::Session { id, owner } => {
            cli::session::run(&config_path, &id, owner.as_deref()).await?;
        }
        Commands::Info => {
            cli::info::run(&config_path).await?;
        }
        Commands::Keygen => {
            cli::keygen::run();
        }
        Commands::InitConfig { force } => {
            cli::init::run(&config_path, force)?;
        }
    }

    Ok(())
}
