use crate::actor::ActorClient;
use crate::replica::{ProposeError, ProposeInput, ProposeOutput};
use bytes::Bytes;

/// The application's write handle: propose commands for replication.
pub struct ReplicatedLog {
    actor_client: ActorClient,
}

impl ReplicatedLog {
    pub(crate) fn new(actor_client: ActorClient) -> Self {
        ReplicatedLog { actor_client }
    }

    /// Proposes a command for replication. Succeeds only on the current leader; the returned
    /// `(index, term)` identify the tentative log slot. The command is committed once the commit
    /// stream delivers that index. A `NotLeader` error carries the last known leader, if any, for
    /// the caller to redirect to.
    pub async fn propose(&self, data: Bytes) -> Result<ProposeOutput, ProposeError> {
        self.actor_client.propose(ProposeInput { data }).await
    }

    pub(crate) async fn shut_down(&self) {
        self.actor_client.shut_down().await;
    }
}
