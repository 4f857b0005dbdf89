//! Nodes Command Implementation

use anyhow::Result;
use dv_core::clock::SystemClock;
use dv_core::discovery::{DiscoveryAggregator, NodeCache, NodeFilter, Provenance};
use dv_core::ledger::rpc::RpcLedger;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Print the ranked node listing
pub async fn run(
    config_path: &Path,
    region: Option<String>,
    min_trust: Option<Provenance>,
    include_unverified: bool,
    json: bool,
) -> Result<()> {
    let config = super::load_config(config_path)?;
    let ledger = Arc::new(RpcLedger::new(&config.ledger.rpc_url, config.program_id()?, config.ledger_timeout())?);
    let cache = Arc::new(NodeCache::new(Duration::from_secs(config.discovery.freshness_secs)));
    let discovery = DiscoveryAggregator::new(ledger.clone(), Arc::new(SystemClock), cache, config.ledger.layout_version)
        .with_read_timeout(config.ledger_timeout());

    let outcome = discovery.refresh_from_ledger().await;
    if !outcome.refreshed {
        anyhow::bail!("ledger at {} is unreachable", ledger.url());
    }

    let filter = NodeFilter {
        region,
        min_trust,
        include_unverified,
    };
    let nodes = discovery.list(&filter);

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    if nodes.is_empty() {
        println!("No active nodes.");
        return Ok(());
    }
    println!("{:<50} {:<24} {:<12} {:>14} {:>8}", "NODE", "ENDPOINT", "REGION", "PRICE/MIN", "CAPACITY");
    for node in &nodes {
        println!(
            "{:<50} {:<24} {:<12} {:>14} {:>8}",
            node.key.to_string(),
            node.endpoint,
            node.region,
            node.price_per_minute,
            node.max_capacity,
        );
    }
    Ok(())
}
