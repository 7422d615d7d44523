//! WolfVote - External Tie-Break Voter for Failover Stripes
//!
//! A stripe of two servers cannot form a majority on its own. WolfVote
//! joins such a stripe as an external voter: it registers with the
//! active coordinator, heartbeats every server, and grants at most one
//! vote per election term to the single server it currently backs.
//!
//! # Architecture
//!
//! A [`Voter`] holds one [`voting::VotingSession`] per stripe. Each session
//! bootstraps against a seed list, keeps one [`peer::PeerMonitor`] per
//! server, and arbitrates the election events those monitors raise under
//! a single lock. Servers are reached through the [`network`] diagnostics
//! transport.
//!
//! # Features
//!
//! - Vote ownership with stealing from a lost owner and zombie suppression
//! - Bootstrap against an unknown topology with fixed-interval retries
//! - Topology polling and monitor reconciliation
//! - Override votes and server probing for operators

pub mod config;
pub mod error;
pub mod network;
pub mod peer;
pub mod testing;
pub mod voter;
pub mod voting;

pub use config::VoterConfig;
pub use error::{Error, Result};
pub use voter::Voter;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::VoterConfig;
    pub use crate::error::{Error, Result};
    pub use crate::peer::{PeerClient, PeerConnection, PeerMonitor};
    pub use crate::voter::{ProbeReport, Voter};
    pub use crate::voting::{SessionConfig, VoteAction, VoterStatus, VotingSession};
}
