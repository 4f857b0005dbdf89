//! Sweep Command Implementation

use anyhow::Result;
use dv_daemon::{cleanup_reaper, Collaborators};
use std::path::Path;

/// Run a single reaper pass against the configured ledger and interface
pub async fn run(config_path: &Path, dry_run: bool) -> Result<()> {
    let config = super::load_config(config_path)?;
    let dry_run = dry_run || config.reaper.dry_run;

    let parts = Collaborators::from_config(&config)?;
    let reaper = cleanup_reaper(&config, &parts)?;
    let report = reaper.sweep(dry_run).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.commit_failed {
        anyhow::bail!("lease file could not be updated; revoked peers are gone from the interface");
    }
    Ok(())
}
