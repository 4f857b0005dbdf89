//! Init-Config Command Implementation

use anyhow::{bail, Result};
use dv_core::DvpnConfig;
use std::path::Path;

/// Write the default configuration to `path`
pub fn run(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    DvpnConfig::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
