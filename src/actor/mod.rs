//! The single-threaded event loop that owns all replica state. Every external input (client
//! proposals, inbound RPCs, timer ticks, RPC replies) becomes an [`Event`] on one queue, so
//! handlers never contend with each other and never hold a lock across an await.

use crate::replica::{
    AppendEntriesReplyFromPeer, HeartbeatTick, PersistentStorage, ProposeError, ProposeInput, ProposeOutput, Replica,
    RequestVoteReplyFromPeer, RpcError,
};
use crate::transport::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub(crate) enum Event {
    Propose(ProposeInput, Callback<ProposeOutput, ProposeError>),
    RequestVote(RequestVoteRequest, Callback<RequestVoteResponse, RpcError>),
    AppendEntries(AppendEntriesRequest, Callback<AppendEntriesResponse, RpcError>),
    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),
    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),
    HeartbeatTick(HeartbeatTick),
    ElectionTimeout,
    ShutDown,
}

/// One-shot reply channel bundled into an Event. Dropping it without sending tells the caller the
/// replica exited.
#[derive(Debug)]
pub(crate) struct Callback<O, E>(oneshot::Sender<Result<O, E>>);

impl<O, E> Callback<O, E> {
    fn new() -> (Self, oneshot::Receiver<Result<O, E>>) {
        let (tx, rx) = oneshot::channel();
        (Callback(tx), rx)
    }

    pub(crate) fn send(self, result: Result<O, E>) {
        // Caller may have given up waiting. Nothing for us to do about it.
        let _ = self.0.send(result);
    }
}

/// Strong handle to the actor queue. As long as one of these is alive, the event loop keeps
/// running. The application-facing API holds the strong handle; everything internal (timers, RPC
/// handlers, spawned peer calls) holds a [`WeakActorClient`] so it can't keep a shut-down replica
/// alive.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn propose(&self, input: ProposeInput) -> Result<ProposeOutput, ProposeError> {
        let (callback, rx) = Callback::new();
        if self.sender.send(Event::Propose(input, callback)).await.is_err() {
            return Err(ProposeError::ReplicaExited);
        }

        rx.await.unwrap_or(Err(ProposeError::ReplicaExited))
    }

    pub(crate) async fn shut_down(&self) {
        let _ = self.sender.send(Event::ShutDown).await;
    }
}

#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

struct ActorExited;

impl WeakActorClient {
    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        match self.sender.upgrade() {
            Some(sender) => sender.send(event).await.map_err(|_| ActorExited),
            None => Err(ActorExited),
        }
    }

    pub(crate) async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse, RpcError> {
        let (callback, rx) = Callback::new();
        if self.send(Event::RequestVote(request, callback)).await.is_err() {
            return Err(RpcError::ReplicaExited);
        }

        rx.await.unwrap_or(Err(RpcError::ReplicaExited))
    }

    pub(crate) async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError> {
        let (callback, rx) = Callback::new();
        if self.send(Event::AppendEntries(request, callback)).await.is_err() {
            return Err(RpcError::ReplicaExited);
        }

        rx.await.unwrap_or(Err(RpcError::ReplicaExited))
    }

    pub(crate) async fn request_vote_reply_from_peer(&self, reply: RequestVoteReplyFromPeer) -> Result<(), ()> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await.map_err(|_| ())
    }

    pub(crate) async fn append_entries_reply_from_peer(&self, reply: AppendEntriesReplyFromPeer) -> Result<(), ()> {
        self.send(Event::AppendEntriesReplyFromPeer(reply)).await.map_err(|_| ())
    }

    pub(crate) async fn heartbeat_tick(&self, tick: HeartbeatTick) -> Result<(), ()> {
        self.send(Event::HeartbeatTick(tick)).await.map_err(|_| ())
    }

    pub(crate) async fn election_timeout(&self) -> Result<(), ()> {
        self.send(Event::ElectionTimeout).await.map_err(|_| ())
    }
}

/// Owns the replica and drains the event queue until shutdown or until every client handle drops.
pub(crate) struct ReplicaActor<S: PersistentStorage> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: Replica<S>,
}

impl<S: PersistentStorage> ReplicaActor<S> {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: Replica<S>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        slog::info!(self.logger, "Starting replica event loop");
        while let Some(event) = self.receiver.recv().await {
            if let Event::ShutDown = event {
                self.replica.handle_shut_down();
                break;
            }
            self.handle_event(event);
        }
        slog::info!(self.logger, "Replica event loop exited");
    }

    fn handle_event(&mut self, event: Event) {
        slog::trace!(self.logger, "Received event: {:?}", event);
        match event {
            Event::Propose(input, callback) => callback.send(self.replica.handle_propose(input)),
            // A storage failure surfaces as a failed RPC, never a positive reply: no ack leaves
            // this replica until the state change behind it is durable.
            Event::RequestVote(request, callback) => callback.send(self.replica.handle_request_vote(request)),
            Event::AppendEntries(request, callback) => callback.send(self.replica.handle_append_entries(request)),
            Event::RequestVoteReplyFromPeer(reply) => self.replica.handle_request_vote_reply(reply),
            Event::AppendEntriesReplyFromPeer(reply) => self.replica.handle_append_entries_reply(reply),
            Event::HeartbeatTick(tick) => self.replica.handle_heartbeat_tick(tick),
            Event::ElectionTimeout => self.replica.handle_election_timeout(),
            Event::ShutDown => unreachable!("ShutDown is handled by the event loop"),
        }
    }
}
