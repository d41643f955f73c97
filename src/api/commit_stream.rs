use crate::replica::Index;
use bytes::Bytes;
use tokio::sync::mpsc;

pub(crate) fn create_commit_stream() -> (CommitStreamPublisher, CommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    let publisher = CommitStreamPublisher { sender: tx };
    let stream = CommitStream { receiver: rx };

    (publisher, stream)
}

pub(crate) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<CommittedEntry>,
}

impl CommitStreamPublisher {
    pub(crate) fn notify_commit(&self, logger: &slog::Logger, entry: CommittedEntry) {
        if self.sender.send(entry).is_err() {
            slog::warn!(logger, "CommitStream has disconnected.");
        }
    }
}

/// Ordered, once-only delivery of committed entries to the owning application. Entries arrive in
/// strictly increasing index order with no gaps; apply each to your state machine as it arrives.
pub struct CommitStream {
    receiver: mpsc::UnboundedReceiver<CommittedEntry>,
}

#[derive(Debug, PartialEq)]
pub struct CommittedEntry {
    /// True for a replicated command. Reserved against future delivery kinds that aren't commands.
    pub valid: bool,
    pub index: Index,
    pub data: Bytes,
}

impl CommitStream {
    /// Returns the next committed entry, or `None` after the replica has shut down and all
    /// previously committed entries have been drained.
    pub async fn next(&mut self) -> Option<CommittedEntry> {
        self.receiver.recv().await
    }
}
