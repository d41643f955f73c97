use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, Term};

/// An event observed by the local replica.
///
/// Election events don't queue: if several transitions happen between two `next_event()` calls,
/// only the most recent one is observed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RaftEvent {
    Election(ElectionEvent),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ElectionEvent {
    Leader { term: Term },
    Candidate { term: Term },
    Follower { term: Term, leader_replica_id: Option<String> },
}

pub struct RaftEventListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl RaftEventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        RaftEventListener {
            election_state_change_listener,
        }
    }

    /// Returns the next observed event, or `None` after the replica has shut down.
    pub async fn next_event(&mut self) -> Option<RaftEvent> {
        self.election_state_change_listener
            .next()
            .await
            .map(|snapshot| RaftEvent::Election(ElectionEvent::from(snapshot)))
    }
}

impl From<ElectionStateSnapshot> for ElectionEvent {
    fn from(snapshot: ElectionStateSnapshot) -> Self {
        match snapshot {
            ElectionStateSnapshot::Leader(term) => ElectionEvent::Leader { term },
            ElectionStateSnapshot::Candidate(term) => ElectionEvent::Candidate { term },
            ElectionStateSnapshot::Follower(term, leader) => ElectionEvent::Follower {
                term,
                leader_replica_id: leader.map(|id| id.into_inner()),
            },
        }
    }
}
