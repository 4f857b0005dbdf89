//! Session Command Implementation

use anyhow::Result;
use dv_core::clock::SystemClock;
use dv_core::lease::LeaseStore;
use dv_core::ledger::rpc::RpcLedger;
use dv_core::ledger::Pubkey;
use dv_core::session::SessionVerifier;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Print a session account, whether it passes verification, and its lease
pub async fn run(config_path: &Path, id: &str, owner: Option<&str>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let address: Pubkey = id.parse()?;
    let ledger = RpcLedger::new(&config.ledger.rpc_url, config.program_id()?, config.ledger_timeout())?;
    let verifier = SessionVerifier::new(
        Arc::new(ledger),
        Arc::new(SystemClock),
        config.ledger.layout_version,
        config.session.funding_floor,
    )
    .with_read_timeout(config.ledger_timeout());

    let session = verifier.load(&address).await?;
    let verdict = match owner {
        Some(owner) => verifier.verify_address(&address, &owner.parse()?).await,
        None => verifier.check_address(&address).await,
    };
    let leases = LeaseStore::open(config.leases_path(), config.lock_retry())?;

    let view = json!({
        "address": address,
        "session": session,
        "valid": verdict.is_ok(),
        "rejection": verdict.as_ref().err().map(|e| e.to_string()),
        "remainingSecs": verdict.as_ref().ok().map(|v| v.remaining_secs),
        "lease": leases.get(&address),
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}
