//! Info Command Implementation

use anyhow::Result;
use dv_core::lease::LeaseStore;
use dv_core::network::PeerIdentity;
use dv_core::brand;
use std::path::Path;

/// Print the effective configuration summary
pub async fn run(config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    let identity = PeerIdentity::load_or_generate(&config.discovery.identity_path)?;
    let leases = LeaseStore::open(config.leases_path(), config.lock_retry())?;

    println!("{} {}", brand::PRODUCT_NAME, env!("CARGO_PKG_VERSION"));
    println!();
    println!("  config:        {}", config_path.display());
    println!("  ledger:        {}", config.ledger.rpc_url);
    println!("  program:       {}", config.ledger.program_id);
    println!("  layout:        v{}", config.ledger.layout_version);
    match config.node_address()? {
        Some(node) => println!("  node account:  {}", node),
        None => println!("  node account:  (not configured)"),
    }
    println!("  interface:     {}", config.tunnel.interface);
    println!("  address pool:  {}", config.tunnel.address_pool);
    println!("  http:          {}:{}", config.server.bind, config.server.port);
    println!("  peer id:       {}", identity.peer_id());
    println!("  lease file:    {}", config.leases_path().display());
    println!("  leases:        {}", leases.len());
    println!();

    Ok(())
}
