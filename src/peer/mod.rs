//! Peer Module
//!
//! Per-server state for the voter: the [`PeerClient`] operations against
//! one stripe server and the [`PeerMonitor`] that heartbeats it.

mod connection;
mod monitor;

pub use connection::{
    PeerClient, PeerConnection, PeerSnapshot, HEARTBEAT_RESPONSE, INVALID_VOTER_RESPONSE,
    TOPOLOGY_MBEAN, VOTER_MANAGER,
};
pub use monitor::{ElectionHandler, PeerMonitor};
