mod election;
mod log;
mod peers;
mod persistent_state;
mod replica;
mod replica_api;
mod timers;

pub use log::Index;
pub use peers::ClusterError;
pub use peers::ReplicaId;
pub use persistent_state::FileStorage;
pub use persistent_state::InMemoryStorage;
pub use persistent_state::PersistentStorage;
pub use persistent_state::Term;
pub use replica_api::ProposeError;
pub use replica_api::ProposeInput;
pub use replica_api::ProposeOutput;
pub use replica_api::RpcError;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use peers::ClusterMembers;
pub(crate) use persistent_state::PersistentState;
pub(crate) use replica::create_replica;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaConfig;
pub(crate) use replica_api::AppendEntriesReplyFromPeer;
pub(crate) use replica_api::HeartbeatTick;
pub(crate) use replica_api::RequestVoteReplyFromPeer;
