//! Daemon Server
//!
//! Main daemon that wires the ledger, the tunnel interface and the gossip
//! network together, serves the request surface and keeps the expiry reaper
//! running.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dv_core::authorizer::{PeerAuthorizer, ServerPeerInfo};
use dv_core::clock::{Clock, SystemClock};
use dv_core::crypto::TunnelKey;
use dv_core::discovery::{DiscoveryAggregator, NodeCache};
use dv_core::lease::LeaseStore;
use dv_core::ledger::rpc::RpcLedger;
use dv_core::ledger::{decode_node, LedgerClient, NodeAccount};
use dv_core::locks::SessionLocks;
use dv_core::network::{NetworkEvent, PeerNetwork};
use dv_core::protocol::Announcement;
use dv_core::reaper::{ExpiryReaper, SweepReport};
use dv_core::session::SessionVerifier;
use dv_core::tunnel::{TunnelControl, WgTunnel};
use dv_core::{DvpnConfig, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handlers::{self, AppState, NodeProfile};

/// Events from the daemon to whoever is watching it
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// HTTP surface is accepting requests
    Ready { http: SocketAddr, peer_id: Option<String> },

    /// Gossip listener address
    Listening { address: String },

    PeerConnected { peer_id: String },

    PeerDisconnected { peer_id: String },

    /// Ledger node refresh finished
    LedgerRefreshed { nodes: usize, stale: bool },

    /// Our own announcement went out
    Announced,

    /// Error occurred
    Error { message: String },

    Shutdown,
}

/// Commands to the daemon
#[derive(Debug)]
pub enum DaemonCommand {
    /// Run one reaper pass now
    Sweep {
        dry_run: bool,
        reply: oneshot::Sender<SweepReport>,
    },

    /// Shutdown daemon
    Shutdown,
}

/// Ledger, tunnel and clock the daemon runs against
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerClient>,
    pub tunnel: Arc<dyn TunnelControl>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// JSON-RPC ledger, `wg` on the configured interface, wall clock
    pub fn from_config(config: &DvpnConfig) -> Result<Self> {
        let ledger = RpcLedger::new(&config.ledger.rpc_url, config.program_id()?, config.ledger_timeout())?;
        let tunnel = WgTunnel::new(
            &config.tunnel.interface,
            config.tunnel.use_sudo,
            Duration::from_secs(config.tunnel.command_timeout_secs),
        );
        Ok(Self {
            ledger: Arc::new(ledger),
            tunnel: Arc::new(tunnel),
            clock: Arc::new(SystemClock),
        })
    }
}

fn build_verifier(config: &DvpnConfig, parts: &Collaborators) -> Arc<SessionVerifier> {
    Arc::new(
        SessionVerifier::new(
            parts.ledger.clone(),
            parts.clock.clone(),
            config.ledger.layout_version,
            config.session.funding_floor,
        )
        .with_read_timeout(config.ledger_timeout()),
    )
}

/// A reaper for one-shot cleanup: no HTTP surface, no gossip, and no
/// tunnel server identity needed
pub fn cleanup_reaper(config: &DvpnConfig, parts: &Collaborators) -> Result<ExpiryReaper> {
    config.validate()?;
    let leases = Arc::new(LeaseStore::open(config.leases_path(), config.lock_retry())?);
    let authorizer = Arc::new(PeerAuthorizer::cleanup_only(
        build_verifier(config, parts),
        parts.tunnel.clone(),
        leases,
        SessionLocks::new(),
        config.authorizer_settings()?,
    ));
    Ok(ExpiryReaper::new(authorizer).with_dry_run(config.reaper.dry_run))
}

/// Main daemon server
pub struct DaemonServer {
    config: DvpnConfig,
    clock: Arc<dyn Clock>,
    verifier: Arc<SessionVerifier>,
    authorizer: Arc<PeerAuthorizer>,
    discovery: Arc<DiscoveryAggregator>,
    reaper: Arc<ExpiryReaper>,
    profile: NodeProfile,

    /// Last node account read for our own announcements
    own_node: Option<NodeAccount>,

    event_tx: mpsc::Sender<DaemonEvent>,
    event_rx: Option<mpsc::Receiver<DaemonEvent>>,
    command_tx: mpsc::Sender<DaemonCommand>,
    command_rx: mpsc::Receiver<DaemonCommand>,
}

impl DaemonServer {
    /// Build every component; nothing is listening yet
    pub async fn new(config: DvpnConfig, parts: Collaborators) -> Result<Self> {
        config.validate()?;
        let layout = config.ledger.layout_version;
        let verifier = build_verifier(&config, &parts);

        let profile = NodeProfile {
            node_address: config.node_address()?,
            endpoint: config.server.endpoint.clone(),
            region: config.server.region.clone(),
            tunnel_key: config
                .tunnel
                .server_public_key
                .as_deref()
                .map(str::parse::<TunnelKey>)
                .transpose()?,
        };

        let own_node = match profile.node_address {
            Some(address) => match verifier.fetch(&address).await.and_then(|b| Ok(decode_node(&b, layout)?)) {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!(node = %address, "Could not read own node account: {}", e);
                    None
                }
            },
            None => None,
        };
        let server = match &own_node {
            Some(node) => ServerPeerInfo {
                public_key: TunnelKey::from_bytes(node.wg_server_pubkey),
                endpoint: config.server.endpoint.clone().unwrap_or_else(|| node.endpoint.clone()),
            },
            None => config.configured_server_peer()?,
        };
        info!(endpoint = %server.endpoint, key = %server.public_key, "Serving as tunnel peer");

        let leases = Arc::new(LeaseStore::open(config.leases_path(), config.lock_retry())?);
        let authorizer = Arc::new(PeerAuthorizer::new(
            verifier.clone(),
            parts.tunnel.clone(),
            leases,
            SessionLocks::new(),
            config.authorizer_settings()?,
            server,
        ));

        let cache = Arc::new(NodeCache::new(Duration::from_secs(config.discovery.freshness_secs)));
        let discovery = Arc::new(
            DiscoveryAggregator::new(parts.ledger.clone(), parts.clock.clone(), cache, layout)
                .with_ttl(Duration::from_secs(config.ledger.cache_ttl_secs))
                .with_read_timeout(config.ledger_timeout()),
        );

        let reaper = Arc::new(ExpiryReaper::new(authorizer.clone()).with_dry_run(config.reaper.dry_run));

        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);

        Ok(Self {
            config,
            clock: parts.clock,
            verifier,
            authorizer,
            discovery,
            reaper,
            profile,
            own_node,
            event_tx,
            event_rx: Some(event_rx),
            command_tx,
            command_rx,
        })
    }

    /// Get the command sender
    pub fn command_sender(&self) -> mpsc::Sender<DaemonCommand> {
        self.command_tx.clone()
    }

    /// Take the event receiver; events are dropped if nobody takes it
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<DaemonEvent>> {
        self.event_rx.take()
    }

    pub fn reaper(&self) -> &Arc<ExpiryReaper> {
        &self.reaper
    }

    pub fn authorizer(&self) -> &Arc<PeerAuthorizer> {
        &self.authorizer
    }

    pub fn discovery(&self) -> &Arc<DiscoveryAggregator> {
        &self.discovery
    }

    fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            verifier: self.verifier.clone(),
            authorizer: self.authorizer.clone(),
            discovery: self.discovery.clone(),
            profile: self.profile.clone(),
            started_at: Instant::now(),
        })
    }

    async fn emit(&self, event: DaemonEvent) {
        if self.event_rx.is_none() {
            let _ = self.event_tx.send(event).await;
        }
    }

    /// Run until a shutdown command arrives
    pub async fn run(mut self) -> Result<()> {
        info!("Starting DVPN daemon...");
        let cancel = CancellationToken::new();

        let bind = format!("{}:{}", self.config.server.bind, self.config.server.port);
        let listener = TcpListener::bind(bind.as_str()).await?;
        let http_addr = listener.local_addr()?;
        let app = handlers::router(self.app_state());
        let http_cancel = cancel.clone();
        let http = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { http_cancel.cancelled().await })
                .await
        });
        info!("Request surface listening on {}", http_addr);

        let reaper = self.reaper.clone();
        let reaper_cancel = cancel.clone();
        let interval = Duration::from_secs(self.config.reaper.interval_secs);
        let reaper_task = tokio::spawn(async move { reaper.run(interval, reaper_cancel).await });

        let mut network = if self.config.discovery.enable_gossip {
            let mut network = PeerNetwork::new(self.config.discovery.clone())?;
            network.start_listening()?;
            Some(network)
        } else {
            None
        };
        let peer_id = network.as_ref().map(|n| n.peer_id().to_string());

        self.discovery.refresh_from_ledger().await;
        self.emit(DaemonEvent::Ready { http: http_addr, peer_id }).await;

        let mut refresh_tick = tokio::time::interval(Duration::from_secs(self.config.ledger.cache_ttl_secs.max(1)));
        let mut announce_tick =
            tokio::time::interval(Duration::from_secs(self.config.discovery.announce_interval_secs.max(1)));
        refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        announce_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(DaemonCommand::Sweep { dry_run, reply }) => {
                            let reaper = self.reaper.clone();
                            tokio::spawn(async move {
                                let _ = reply.send(reaper.sweep(dry_run).await);
                            });
                        }
                        Some(DaemonCommand::Shutdown) | None => {
                            info!("Shutdown command received");
                            break;
                        }
                    }
                }

                _ = refresh_tick.tick() => self.refresh().await,

                _ = announce_tick.tick(), if network.is_some() => {
                    if let Some(network) = network.as_mut() {
                        self.announce(network).await;
                    }
                }

                event = next_network_event(&mut network) => self.handle_network_event(event).await,
            }
        }

        cancel.cancel();
        if let Err(e) = reaper_task.await {
            error!("Reaper task ended abnormally: {}", e);
        }
        match http.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Request surface failed: {}", e),
            Err(e) => error!("Request surface task ended abnormally: {}", e),
        }
        self.emit(DaemonEvent::Shutdown).await;
        info!("DVPN daemon stopped");
        Ok(())
    }

    async fn refresh(&self) {
        let outcome = self.discovery.refresh_from_ledger().await;
        if outcome.refreshed || outcome.stale {
            self.emit(DaemonEvent::LedgerRefreshed {
                nodes: outcome.ledger_nodes,
                stale: outcome.stale,
            })
            .await;
        }
    }

    /// Publish our node, re-reading the account when possible
    async fn announce(&mut self, network: &mut PeerNetwork) {
        let Some(address) = self.profile.node_address else {
            debug!("No node account configured, not announcing");
            return;
        };
        let layout = self.config.ledger.layout_version;
        match self.verifier.fetch(&address).await.and_then(|b| Ok(decode_node(&b, layout)?)) {
            Ok(node) => self.own_node = Some(node),
            Err(e) => debug!(node = %address, "Announcing last known node account: {}", e),
        }
        let Some(node) = &self.own_node else {
            return;
        };
        if !node.is_active {
            debug!("Node account inactive, not announcing");
            return;
        }

        let announcement = Announcement::from_node(node, Some(address), self.clock.now());
        match network.publish(&announcement) {
            Ok(true) => self.emit(DaemonEvent::Announced).await,
            Ok(false) => {}
            Err(e) => {
                warn!("Announcement failed: {}", e);
                self.emit(DaemonEvent::Error { message: e.to_string() }).await;
            }
        }
    }

    async fn handle_network_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::Announcement { source, data } => {
                if self.discovery.on_announcement(&data) {
                    debug!(%source, "Merged node announcement");
                }
            }
            NetworkEvent::Listening { address } => {
                self.emit(DaemonEvent::Listening { address: address.to_string() }).await;
            }
            NetworkEvent::PeerConnected { peer_id } => {
                self.emit(DaemonEvent::PeerConnected { peer_id: peer_id.to_string() }).await;
            }
            NetworkEvent::PeerDisconnected { peer_id } => {
                self.emit(DaemonEvent::PeerDisconnected { peer_id: peer_id.to_string() }).await;
            }
        }
    }
}

async fn next_network_event(network: &mut Option<PeerNetwork>) -> NetworkEvent {
    match network {
        Some(network) => network.next_event().await,
        // No gossip, pend forever
        None => std::future::pending().await,
    }
}
