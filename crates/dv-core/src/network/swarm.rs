//! Swarm Management for DVPN
//!
//! High-level interface over the libp2p swarm: publish our announcement,
//! surface everyone else's.

use futures::StreamExt;
use libp2p::{
    gossipsub, identify, mdns, ping,
    swarm::{behaviour::toggle::Toggle, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::behaviour::{DvpnBehaviour, DvpnBehaviourEvent, IDENTIFY_PROTOCOL};
use super::identity::PeerIdentity;
use crate::brand;
use crate::config::DiscoveryConfig;
use crate::error::{DvpnError, Result};
use crate::protocol::{Announcement, ANNOUNCE_TOPIC, MAX_ANNOUNCEMENT_BYTES};

/// Events emitted by the peer network
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Listening on an address
    Listening { address: Multiaddr },
    /// Peer connected
    PeerConnected { peer_id: PeerId },
    /// Peer disconnected
    PeerDisconnected { peer_id: PeerId },
    /// Raw announcement payload, not yet validated
    Announcement { source: PeerId, data: Vec<u8> },
}

/// High-level peer network manager
pub struct PeerNetwork {
    identity: PeerIdentity,
    config: DiscoveryConfig,
    swarm: Swarm<DvpnBehaviour>,
    topic: gossipsub::IdentTopic,
}

impl PeerNetwork {
    /// Create a new peer network subscribed to the announcement topic
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        let identity = PeerIdentity::load_or_generate(&config.identity_path)?;
        let local_peer_id = *identity.peer_id();
        let keypair = identity.keypair().clone();

        info!("Local peer ID: {}", local_peer_id);

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(10))
            .validation_mode(gossipsub::ValidationMode::Strict)
            .max_transmit_size(MAX_ANNOUNCEMENT_BYTES * 2)
            .build()
            .map_err(|e| DvpnError::NetworkInitialization(e.to_string()))?;
        let enable_mdns = config.enable_mdns;

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_quic()
            .with_behaviour(|key| {
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )
                .map_err(|e| e.to_string())?;

                let identify = identify::Behaviour::new(
                    identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                        .with_agent_version(brand::agent_version()),
                );

                let ping = ping::Behaviour::new(
                    ping::Config::new()
                        .with_interval(Duration::from_secs(15))
                        .with_timeout(Duration::from_secs(10)),
                );

                let mdns = if enable_mdns {
                    Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
                } else {
                    None
                };

                Ok(DvpnBehaviour {
                    gossipsub,
                    identify,
                    ping,
                    mdns: Toggle::from(mdns),
                })
            })
            .map_err(|e| DvpnError::NetworkInitialization(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let topic = gossipsub::IdentTopic::new(ANNOUNCE_TOPIC);
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| DvpnError::NetworkInitialization(format!("subscribe {}: {:?}", ANNOUNCE_TOPIC, e)))?;

        for peer_addr in &config.bootstrap_peers {
            match peer_addr.parse::<Multiaddr>() {
                Ok(addr) => {
                    info!("Dialing bootstrap peer: {}", addr);
                    if let Err(e) = swarm.dial(addr) {
                        warn!("Bootstrap dial failed: {}", e);
                    }
                }
                Err(e) => warn!("Ignoring bootstrap peer {:?}: {}", peer_addr, e),
            }
        }

        Ok(Self {
            identity,
            config,
            swarm,
            topic,
        })
    }

    /// Get our peer ID
    pub fn peer_id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    /// Start listening
    pub fn start_listening(&mut self) -> Result<Vec<Multiaddr>> {
        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", self.config.listen_port)
            .parse()
            .map_err(|e| DvpnError::NetworkInitialization(format!("Invalid address: {}", e)))?;

        self.swarm
            .listen_on(listen_addr)
            .map_err(|e| DvpnError::NetworkInitialization(e.to_string()))?;

        Ok(self.swarm.listeners().cloned().collect())
    }

    /// Publish an announcement. Returns false when no peer is subscribed yet.
    pub fn publish(&mut self, announcement: &Announcement) -> Result<bool> {
        let bytes = announcement.to_bytes()?;
        match self.swarm.behaviour_mut().gossipsub.publish(self.topic.clone(), bytes) {
            Ok(_) => Ok(true),
            Err(gossipsub::PublishError::InsufficientPeers) => {
                debug!("No gossip peers yet, announcement not sent");
                Ok(false)
            }
            // Unchanged announcement inside the duplicate cache window
            Err(gossipsub::PublishError::Duplicate) => Ok(true),
            Err(e) => Err(DvpnError::NetworkInitialization(format!("publish: {:?}", e))),
        }
    }

    /// Drive the swarm until it yields something the daemon cares about
    pub async fn next_event(&mut self) -> NetworkEvent {
        loop {
            let event = self.swarm.select_next_some().await;
            if let Some(event) = self.handle_swarm_event(event) {
                return event;
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<DvpnBehaviourEvent>) -> Option<NetworkEvent> {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                Some(NetworkEvent::Listening { address })
            }

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("Connected to peer: {}", peer_id);
                Some(NetworkEvent::PeerConnected { peer_id })
            }

            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!("Disconnected from peer: {}", peer_id);
                Some(NetworkEvent::PeerDisconnected { peer_id })
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer_id) = peer_id {
                    warn!("Failed to connect to {}: {}", peer_id, error);
                }
                None
            }

            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),

            _ => None,
        }
    }

    fn handle_behaviour_event(&mut self, event: DvpnBehaviourEvent) -> Option<NetworkEvent> {
        match event {
            DvpnBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => Some(NetworkEvent::Announcement {
                source: message.source.unwrap_or(propagation_source),
                data: message.data,
            }),

            DvpnBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    debug!("Discovered peer via mDNS: {} at {}", peer_id, addr);
                    self.swarm.add_peer_address(peer_id, addr);
                    self.swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                }
                None
            }

            DvpnBehaviourEvent::Mdns(mdns::Event::Expired(peers)) => {
                for (peer_id, _) in peers {
                    self.swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                }
                None
            }

            DvpnBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!("Identified peer {}: {:?}", peer_id, info.agent_version);
                for addr in info.listen_addrs {
                    self.swarm.add_peer_address(peer_id, addr);
                }
                None
            }

            DvpnBehaviourEvent::Ping(ping::Event { peer, result: Err(e), .. }) => {
                debug!("Ping to {} failed: {}", peer, e);
                None
            }

            _ => None,
        }
    }
}
