use crate::actor::{ActorClient, ReplicaActor};
use crate::api::event_bus::RaftEventListener;
use crate::api::node::RaftNode;
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::replicated_log::ReplicatedLog;
use crate::api::rpc_handler::RaftRpcHandler;
use crate::observer::{NoOpObserver, RaftObserver};
use crate::replica::{self, ClusterError, ClusterMembers, PersistentState, PersistentStorage, ReplicaId};
use crate::transport::RaftTransport;
use std::convert::TryFrom;
use std::io;
use std::sync::Arc;

pub struct RaftConfig<S: PersistentStorage> {
    pub my_replica_id: ReplicaId,
    /// All members of the cluster, this replica included. Membership is fixed for the life of the
    /// process.
    pub cluster_members: Vec<ReplicaId>,
    pub storage: S,
    pub transport: Arc<dyn RaftTransport>,
    pub observer: Option<Arc<dyn RaftObserver>>,
    pub logger: slog::Logger,
    pub options: RaftOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeCreationError {
    #[error("Invalid cluster membership: {0}")]
    InvalidClusterMembership(#[from] ClusterError),
    #[error("Illegal options: {0}")]
    IllegalOptions(&'static str),
    #[error("Failed to load persisted state")]
    StorageLoad(#[source] io::Error),
}

/// Wires up and starts a replica: loads persisted state, spawns the event loop, and hands back the
/// application-facing surfaces. Must be called within a tokio runtime.
pub fn try_create_raft_node<S: PersistentStorage>(config: RaftConfig<S>) -> Result<RaftNode, NodeCreationError> {
    let logger = config
        .logger
        .new(slog::o!("replica_id" => config.my_replica_id.as_str().to_string()));

    let cluster_members = ClusterMembers::new(config.my_replica_id, config.cluster_members)?;
    let options = RaftOptionsValidated::try_from(config.options).map_err(NodeCreationError::IllegalOptions)?;

    let restored = match config.storage.load().map_err(NodeCreationError::StorageLoad)? {
        None => PersistentState::fresh(),
        Some(blob) => match PersistentState::decode(blob) {
            Some(state) => {
                slog::info!(
                    logger,
                    "Restored persisted state: term={:?}, votedFor={:?}, lastLogIndex={:?}",
                    state.current_term,
                    state.voted_for,
                    state.log.last_index(),
                );
                state
            }
            None => {
                slog::warn!(logger, "Persisted state blob was corrupt. Starting fresh.");
                PersistentState::fresh()
            }
        },
    };

    let (actor_client, actor_queue_rx) = ActorClient::new(16);

    let (replica, commit_stream, election_state_change_listener) = replica::create_replica(
        replica::ReplicaConfig {
            logger: logger.clone(),
            cluster_members,
            storage: config.storage,
            transport: config.transport,
            observer: config.observer.unwrap_or_else(|| Arc::new(NoOpObserver)),
            actor_client: actor_client.weak(),
            leader_heartbeat_duration: options.leader_heartbeat_duration,
            election_min_timeout: options.election_min_timeout,
            election_max_timeout: options.election_max_timeout,
            append_entries_timeout: options.leader_append_entries_timeout,
        },
        restored,
    );

    let rpc_handler = RaftRpcHandler::new(actor_client.weak());

    let replica_actor = ReplicaActor::new(logger, actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    Ok(RaftNode {
        replicated_log: ReplicatedLog::new(actor_client),
        commit_stream,
        event_listener: RaftEventListener::new(election_state_change_listener),
        rpc_handler,
    })
}
