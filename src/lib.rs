mod actor;
mod api;
mod observer;
mod replica;
mod transport;

pub use api::CommitStream;
pub use api::CommittedEntry;
pub use api::ElectionEvent;
pub use api::NodeCreationError;
pub use api::RaftConfig;
pub use api::RaftEvent;
pub use api::RaftEventListener;
pub use api::RaftNode;
pub use api::RaftOptions;
pub use api::RaftRpcHandler;
pub use api::ReplicatedLog;
pub use api::try_create_raft_node;

pub use observer::NoOpObserver;
pub use observer::RaftObserver;

pub use replica::ClusterError;
pub use replica::FileStorage;
pub use replica::InMemoryStorage;
pub use replica::Index;
pub use replica::PersistentStorage;
pub use replica::ProposeError;
pub use replica::ProposeOutput;
pub use replica::ReplicaId;
pub use replica::RpcError;
pub use replica::Term;

pub use transport::AppendEntriesRequest;
pub use transport::AppendEntriesResponse;
pub use transport::RaftTransport;
pub use transport::ReplicatedEntry;
pub use transport::RequestVoteRequest;
pub use transport::RequestVoteResponse;
pub use transport::TransportError;

// All `mod` statements are private; everything public is exported via individual `pub use`
// statements so the internal module layout can change without touching the API.
