//! Serve Command Implementation

use anyhow::Result;
use dv_daemon::{Collaborators, DaemonCommand, DaemonEvent, DaemonServer};
use std::path::Path;
use tracing::{error, info};

/// Run the daemon until interrupted
pub async fn run(config_path: &Path, dry_run: bool) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if dry_run {
        config.reaper.dry_run = true;
    }
    info!(config = %config_path.display(), dry_run = config.reaper.dry_run, "Starting daemon");

    let parts = Collaborators::from_config(&config)?;
    let mut daemon = DaemonServer::new(config, parts).await?;
    let command_tx = daemon.command_sender();
    let mut events = daemon.take_event_receiver();

    let handle = tokio::spawn(daemon.run());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = command_tx.send(DaemonCommand::Shutdown).await;
        }
    });

    if let Some(events) = events.as_mut() {
        while let Some(event) = events.recv().await {
            match event {
                DaemonEvent::Ready { http, peer_id } => {
                    println!("dvpn listening on http://{}", http);
                    if let Some(peer_id) = peer_id {
                        println!("broadcast peer id: {}", peer_id);
                    }
                }
                DaemonEvent::Error { message } => error!("{}", message),
                DaemonEvent::Shutdown => break,
                _ => {}
            }
        }
    }

    handle.await??;
    Ok(())
}
