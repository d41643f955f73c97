//! Fire-and-forget observability hooks. The replica invokes these synchronously from its event
//! loop, so impls must return quickly and must never block; a no-op impl is always safe. Nothing
//! here gates progress or correctness.

use crate::replica::{Index, Term};

pub trait RaftObserver: Send + Sync + 'static {
    /// A follower stopped hearing from the leader it knew for `term` and is about to start an
    /// election. The leader may have crashed, or the link to it may be down.
    fn leader_lost(&self, _term: Term) {}

    /// A follower or candidate timed out and is starting an election for `term`.
    fn election_started(&self, _term: Term) {}

    /// This replica won the election for `term`.
    fn leader_elected(&self, _term: Term) {}

    /// First AppendEntries fan-out after winning `term`. Fires once per term.
    fn first_heartbeat(&self, _term: Term) {}

    /// A command was accepted for replication at (`index`, `term`).
    fn proposal_started(&self, _index: Index, _term: Term) {}

    /// A command proposed on this replica reached quorum and was applied.
    fn proposal_committed(&self, _index: Index, _term: Term) {}

    /// The replica is shutting down.
    fn shutting_down(&self, _was_leader: bool) {}
}

pub struct NoOpObserver;

impl RaftObserver for NoOpObserver {}
