use crate::replica::log::Index;
use crate::replica::peers::ReplicaId;
use crate::replica::persistent_state::Term;
use crate::transport::{AppendEntriesResponse, RequestVoteResponse, TransportError};
use bytes::Bytes;
use std::io;

/// A command the application wants replicated.
#[derive(Debug)]
pub struct ProposeInput {
    pub data: Bytes,
}

#[derive(Debug, PartialEq)]
pub struct ProposeOutput {
    /// Where the command landed in the leader's log. It is committed once it later appears on the
    /// commit stream at this index.
    pub index: Index,
    pub term: Term,
}

#[derive(Debug, thiserror::Error)]
pub enum ProposeError {
    #[error("not leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<ReplicaId> },

    #[error("failed to persist proposed entry")]
    StorageFailure(#[source] io::Error),

    #[error("replica has shut down")]
    ReplicaExited,
}

/// Failure of an inbound RPC handler. A storage failure means the replica could not durably record
/// the state change, so the caller gets a failed call instead of an ack, and retries.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("failed to persist state change")]
    StorageFailure(#[source] io::Error),

    #[error("replica has shut down")]
    ReplicaExited,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    /// The term we were soliciting votes for.
    pub(crate) term: Term,
    pub(crate) result: Result<RequestVoteResponse, TransportError>,
}

/// Everything the leader needs to interpret an AppendEntries reply: what was sent, to whom, when.
#[derive(Clone, Debug)]
pub(crate) struct AppendEntriesCallDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) prev_log_index: Index,
    pub(crate) num_entries: usize,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesCallDescriptor,
    pub(crate) result: Result<AppendEntriesResponse, TransportError>,
}

/// One tick of a leader's per-peer heartbeat timer.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct HeartbeatTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}
