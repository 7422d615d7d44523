//! Voting Module
//!
//! Per-stripe arbitration: deciding which server holds this voter's
//! single vote, bootstrapping against an unknown topology and tracking
//! membership changes.

pub mod arbitration;
mod session;
mod status;

pub use arbitration::{arbitrate, RejectReason, VoteAction};
pub use session::{
    is_registerable, tcp_peer_factory, PeerFactory, SessionConfig, VotingSession,
    ACTIVE_COORDINATOR, PASSIVE_STANDBY, REGISTERABLE_STATES,
};
pub use status::{ServerStatus, StatusSnapshot, VoterStatus};
