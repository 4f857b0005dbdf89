//! Gossip network carrying node announcements

mod behaviour;
mod identity;
mod swarm;

pub use behaviour::{DvpnBehaviour, IDENTIFY_PROTOCOL};
pub use identity::PeerIdentity;
pub use swarm::{NetworkEvent, PeerNetwork};
