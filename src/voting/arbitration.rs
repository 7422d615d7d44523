//! Vote Arbitration
//!
//! Decides what to do with an election event raised for one peer, given
//! the peer currently holding this voter's commitment. The decision is a
//! pure function of the two snapshots; the session applies the returned
//! [`VoteAction`] afterwards.

use crate::peer::PeerSnapshot;

/// Why an election event was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The owner is still connected; nothing happens for the candidate
    OwnerConnected,
    /// The owner is gone but the candidate's term is not newer than the
    /// owner's last certified term
    StaleTerm,
}

/// Outcome of arbitrating one election event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteAction {
    /// No owner: the session is restarting
    Ignore,
    /// The candidate is disconnected and leaves the tracked set
    Evict,
    /// The candidate is the owner; vote for it again
    Defend,
    /// The owner is connected and mid-election; the candidate is zombied
    Suppress,
    /// Nothing to do
    Reject(RejectReason),
    /// Zombie the disconnected owner, vote for the candidate and make it owner
    Steal,
}

impl VoteAction {
    pub fn name(&self) -> &'static str {
        match self {
            VoteAction::Ignore => "ignore",
            VoteAction::Evict => "evict",
            VoteAction::Defend => "defend",
            VoteAction::Suppress => "suppress",
            VoteAction::Reject(_) => "reject",
            VoteAction::Steal => "steal",
        }
    }
}

/// Arbitrate an election event for `candidate`.
///
/// `owner` is `None` while the session has no vote owner.
/// `candidate_is_owner` identifies the owner by address, since the owner
/// and the candidate may be observed through different handles.
pub fn arbitrate(
    candidate: PeerSnapshot,
    owner: Option<PeerSnapshot>,
    candidate_is_owner: bool,
) -> VoteAction {
    let owner = match owner {
        Some(owner) => owner,
        None => return VoteAction::Ignore,
    };

    if !candidate.connected {
        return VoteAction::Evict;
    }

    if candidate_is_owner {
        return VoteAction::Defend;
    }

    if owner.connected {
        return if owner.voting {
            VoteAction::Suppress
        } else {
            VoteAction::Reject(RejectReason::OwnerConnected)
        };
    }

    // Strictly newer only: an equal term may already have our vote elsewhere
    if candidate.generation > owner.last_voted_generation {
        VoteAction::Steal
    } else {
        VoteAction::Reject(RejectReason::StaleTerm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(connected: bool, voting: bool, generation: i64, last_voted: i64) -> PeerSnapshot {
        PeerSnapshot {
            connected,
            voting,
            generation,
            last_voted_generation: last_voted,
        }
    }

    #[test]
    fn test_no_owner_is_ignored() {
        let candidate = peer(true, true, 3, -1);
        assert_eq!(arbitrate(candidate, None, false), VoteAction::Ignore);
        // Even a disconnected candidate is left alone while restarting
        assert_eq!(arbitrate(peer(false, false, 3, -1), None, false), VoteAction::Ignore);
    }

    #[test]
    fn test_disconnected_candidate_is_evicted() {
        let owner = peer(true, false, 2, 2);
        assert_eq!(
            arbitrate(peer(false, true, 9, -1), Some(owner), false),
            VoteAction::Evict
        );
        // The owner itself is evicted when it disconnects
        assert_eq!(
            arbitrate(peer(false, true, 2, 2), Some(peer(false, true, 2, 2)), true),
            VoteAction::Evict
        );
    }

    #[test]
    fn test_owner_defends_its_term() {
        let owner = peer(true, true, 5, 4);
        assert_eq!(arbitrate(owner, Some(owner), true), VoteAction::Defend);
    }

    #[test]
    fn test_voting_owner_suppresses_equal_term() {
        let owner = peer(true, true, 5, 5);
        let candidate = peer(true, true, 5, -1);
        assert_eq!(arbitrate(candidate, Some(owner), false), VoteAction::Suppress);
    }

    #[test]
    fn test_idle_connected_owner_rejects() {
        let owner = peer(true, false, 5, 5);
        let candidate = peer(true, true, 8, -1);
        assert_eq!(
            arbitrate(candidate, Some(owner), false),
            VoteAction::Reject(RejectReason::OwnerConnected)
        );
    }

    #[test]
    fn test_newer_term_steals_from_disconnected_owner() {
        let owner = peer(false, true, 5, 5);
        let candidate = peer(true, true, 6, -1);
        assert_eq!(arbitrate(candidate, Some(owner), false), VoteAction::Steal);
    }

    #[test]
    fn test_equal_term_cannot_steal() {
        let owner = peer(false, false, 5, 5);
        let candidate = peer(true, true, 5, -1);
        assert_eq!(
            arbitrate(candidate, Some(owner), false),
            VoteAction::Reject(RejectReason::StaleTerm)
        );
    }

    #[test]
    fn test_steal_compares_against_last_voted_not_generation() {
        // The owner saw term 7 but was only ever certified for 3
        let owner = peer(false, false, 7, 3);
        assert_eq!(
            arbitrate(peer(true, true, 4, -1), Some(owner), false),
            VoteAction::Steal
        );
    }

    #[test]
    fn test_action_names() {
        assert_eq!(VoteAction::Steal.name(), "steal");
        assert_eq!(VoteAction::Reject(RejectReason::StaleTerm).name(), "reject");
    }
}
