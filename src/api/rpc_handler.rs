use crate::actor::WeakActorClient;
use crate::replica::RpcError;
use crate::transport::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};

/// Inbound edge of the RPC seam: whatever server (gRPC, in-memory test network, ...) receives a
/// peer's call hands it to this handler and sends back the response. Holds a weak handle so a
/// lingering server can't keep a shut-down replica alive.
#[derive(Clone)]
pub struct RaftRpcHandler {
    actor_client: WeakActorClient,
}

impl RaftRpcHandler {
    pub(crate) fn new(actor_client: WeakActorClient) -> Self {
        RaftRpcHandler { actor_client }
    }

    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse, RpcError> {
        self.actor_client.request_vote(request).await
    }

    pub async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse, RpcError> {
        self.actor_client.append_entries(request).await
    }
}
