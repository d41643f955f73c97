use crate::api::commit_stream::CommitStream;
use crate::api::event_bus::RaftEventListener;
use crate::api::replicated_log::ReplicatedLog;
use crate::api::rpc_handler::RaftRpcHandler;

/// A running replica's application-facing surface. Fields are public so the application can split
/// them across tasks (e.g. one task draining the commit stream, another proposing).
pub struct RaftNode {
    pub replicated_log: ReplicatedLog,
    pub commit_stream: CommitStream,
    pub event_listener: RaftEventListener,
    pub rpc_handler: RaftRpcHandler,
}

impl RaftNode {
    /// Stops the replica's event loop. Background timer tasks notice and exit on their own; any
    /// in-flight RPCs fail with `ReplicaExited`.
    pub async fn shut_down(self) {
        self.replicated_log.shut_down().await;
    }
}
