//! Wire-level request/reply types and the outbound transport seam. The consensus core never talks
//! to a network directly; it hands a request to a `RaftTransport` impl and gets back a reply or a
//! failure. Delivery of inbound calls is the transport's job too: it invokes the node's
//! [`RaftRpcHandler`](crate::RaftRpcHandler).

use crate::replica::{Index, ReplicaId, Term};
use bytes::Bytes;

#[derive(Clone, Debug)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: ReplicaId,
    pub last_log_index: Index,
    pub last_log_term: Term,
}

#[derive(Clone, Debug)]
pub struct RequestVoteResponse {
    /// The responder's (possibly updated) term.
    pub term: Term,
    pub vote_granted: bool,
}

/// An entry in flight. Its index is implied by `prev_log_index` plus its position in the batch.
#[derive(Clone, Debug)]
pub struct ReplicatedEntry {
    pub term: Term,
    pub data: Bytes,
}

#[derive(Clone, Debug)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: ReplicaId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    /// Empty for a pure heartbeat.
    pub entries: Vec<ReplicatedEntry>,
    pub leader_commit: Index,
}

#[derive(Clone, Debug)]
pub struct AppendEntriesResponse {
    /// The responder's (possibly updated) term.
    pub term: Term,
    pub success: bool,
    /// On failure, the follower's hint of the earliest log position at which divergence begins.
    pub conflict_index: Option<Index>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer is unreachable")]
    Unreachable,
    #[error("RPC timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Other(String),
}

/// Point-to-point call-with-reply primitive, implemented outside this crate (gRPC, in-memory test
/// network, ...). Calls may be delayed, lost, or answered out of order; the core filters replies
/// by term and sequence number, so an impl only has to return whatever the peer said, or an error.
#[async_trait::async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: &ReplicaId,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn append_entries(
        &self,
        peer: &ReplicaId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}
