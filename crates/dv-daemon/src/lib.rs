//! DVPN Daemon
//!
//! Long-running node service: request surface, gossip discovery and the
//! periodic expiry reaper.

pub mod handlers;
pub mod server;

pub use handlers::{router, ApiError, AppState, NodeProfile};
pub use server::{cleanup_reaper, Collaborators, DaemonCommand, DaemonEvent, DaemonServer};
