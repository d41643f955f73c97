//! The library's application-facing API.
mod commit_stream;
mod event_bus;
mod node;
mod options;
mod replicated_log;
mod rpc_handler;
mod wiring;

pub use commit_stream::CommitStream;
pub use commit_stream::CommittedEntry;
pub use event_bus::ElectionEvent;
pub use event_bus::RaftEvent;
pub use event_bus::RaftEventListener;
pub use node::RaftNode;
pub use options::RaftOptions;
pub use replicated_log::ReplicatedLog;
pub use rpc_handler::RaftRpcHandler;
pub use wiring::try_create_raft_node;
pub use wiring::NodeCreationError;
pub use wiring::RaftConfig;

// So Replica can publish to the commit stream.
pub(crate) use commit_stream::{create_commit_stream, CommitStreamPublisher};
