use crate::actor::WeakActorClient;
use crate::replica::log::Index;
use crate::replica::persistent_state::Term;
use crate::replica::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use crate::replica::ReplicaId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
}

/// ElectionState holds the state that is specific to this replica's current role. Its methods are
/// the "what" of a role change; the replica decides "when". Nothing here validates terms or logs.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    state_change_notifier: ElectionStateChangeNotifier,
}

impl ElectionState {
    /// Creates an ElectionState that starts out as a follower at the restored term.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        term: Term,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let initial_state = State::Follower(FollowerState::new(
            term,
            config.election_min_timeout,
            config.election_max_timeout,
            actor_client.clone(),
        ));
        let (notifier, listener) = state_change_channel(Self::current_state_impl(&initial_state));

        let election_state = Self {
            state: initial_state,
            config,
            actor_client,
            state_change_notifier: notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, term: Term, new_leader: Option<ReplicaId>) {
        match &mut self.state {
            // Already a follower: adopt the new term/leader in place. A higher term says nothing
            // about leader liveness, so the running election deadline must not move.
            State::Follower(fs) => {
                fs.term = term;
                fs.leader = new_leader;
            }
            _ => {
                self.state = State::Follower(FollowerState::with_leader(
                    term,
                    new_leader,
                    self.config.election_min_timeout,
                    self.config.election_max_timeout,
                    self.actor_client.clone(),
                ));
            }
        }
        self.notify_new_state();
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self, term: Term) {
        let mut cs = CandidateState::new(
            term,
            self.config.election_min_timeout,
            self.config.election_max_timeout,
            self.actor_client.clone(),
        );

        // Vote for self
        cs.add_received_vote(self.config.my_replica_id.clone());

        self.state = State::Candidate(cs);
        self.notify_new_state();
    }

    pub(crate) fn transition_to_leader(&mut self, term: Term, peer_ids: HashSet<ReplicaId>, next_index: Index) {
        self.state = State::Leader(LeaderState::new(
            term,
            peer_ids,
            next_index,
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
        ));
        self.notify_new_state();
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Candidate(_) => CurrentLeader::Unknown,
            State::Follower(FollowerState { leader: Some(id), .. }) => CurrentLeader::Other(id.clone()),
            State::Follower(FollowerState { leader: None, .. }) => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.state, State::Leader(_))
    }

    pub(crate) fn is_candidate(&self) -> bool {
        matches!(self.state, State::Candidate(_))
    }

    fn current_state_impl(state: &State) -> ElectionStateSnapshot {
        match state {
            State::Leader(ls) => ElectionStateSnapshot::Leader(ls.term),
            State::Candidate(cs) => ElectionStateSnapshot::Candidate(cs.term),
            State::Follower(fs) => ElectionStateSnapshot::Follower(fs.term, fs.leader.clone()),
        }
    }

    fn notify_new_state(&self) {
        self.state_change_notifier
            .notify_new_state(Self::current_state_impl(&self.state));
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &ReplicaId) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
                self.notify_new_state();
            }
        }
    }

    /// Returns the number of votes received if candidate, or None if no longer a candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.tracker)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState { leader: Some(id), .. }) => write!(f, "Follower(Leader={:?})", id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum CurrentLeader {
    Me,
    Other(ReplicaId),
    Unknown,
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    term: Term,
    tracker: LeaderStateTracker,
}

struct CandidateState {
    term: Term,
    received_votes_from: HashSet<ReplicaId>,
    _election_timeout_tracker: ElectionTimerHandle,
}

struct FollowerState {
    term: Term,
    leader: Option<ReplicaId>,
    election_timeout_tracker: ElectionTimerHandle,
}

impl LeaderState {
    fn new(
        term: Term,
        peer_ids: HashSet<ReplicaId>,
        next_index: Index,
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let mut peer_state = HashMap::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            let heartbeat_timer_handle =
                HeartbeatTimerHandle::spawn_timer_task(heartbeat_duration, actor_client.clone(), peer_id.clone(), term);
            peer_state.insert(peer_id, PeerState::new(heartbeat_timer_handle, next_index));
        }

        Self {
            term,
            tracker: LeaderStateTracker::new(peer_state),
        }
    }
}

impl CandidateState {
    fn new(term: Term, min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient) -> Self {
        Self {
            term,
            received_votes_from: HashSet::with_capacity(3),
            _election_timeout_tracker: ElectionTimerHandle::spawn_timer_task(min_timeout, max_timeout, actor_client),
        }
    }

    /// Returns the number of unique votes received after adding `vote_from`.
    fn add_received_vote(&mut self, vote_from: ReplicaId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(term: Term, min_timeout: Duration, max_timeout: Duration, actor_client: WeakActorClient) -> Self {
        Self::with_leader(term, None, min_timeout, max_timeout, actor_client)
    }

    fn with_leader(
        term: Term,
        leader: Option<ReplicaId>,
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        Self {
            term,
            leader,
            election_timeout_tracker: ElectionTimerHandle::spawn_timer_task(min_timeout, max_timeout, actor_client),
        }
    }

    fn reset_timeout(&self) {
        self.election_timeout_tracker.reset_timeout();
    }
}

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<ReplicaId, PeerState>,
}

impl LeaderStateTracker {
    fn new(peer_state: HashMap<ReplicaId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &ReplicaId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_matched_indexes(&self) -> Vec<Index> {
        self.peer_state.values().map(|ps| ps.matched).collect()
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer.
    heartbeat_timer_handle: HeartbeatTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Index,

    // SeqNo is a logical clock of this term leader's calls to a peer. Each outbound AppendEntries
    // takes the next SeqNo; a reply is applied only if its SeqNo is newer than any reply seen so
    // far and no newer than what was actually sent.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    fn new(heartbeat_timer_handle: HeartbeatTimerHandle, next: Index) -> Self {
        PeerState {
            heartbeat_timer_handle,
            next,
            matched: Index::new(0),
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    pub(crate) fn next_index(&self) -> Index {
        self.next
    }

    pub(crate) fn matched_index(&self) -> Index {
        self.matched
    }

    pub(crate) fn record_reply(&mut self, logger: &slog::Logger, received_seq_no: u64, update: PeerReplyUpdate) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(logger, "Dropping out of date seq-no({}): {:?}", received_seq_no, update);
            return;
        }

        match update {
            PeerReplyUpdate::CallFailed => { /* SeqNo ratchet was the only effect. */ }
            PeerReplyUpdate::Replicated {
                prev_log_index,
                num_entries,
            } => {
                self.advance_log(prev_log_index, num_entries);
            }
            PeerReplyUpdate::Conflict { hint } => {
                self.rewind_log(hint);
            }
        }
    }

    fn advance_log(&mut self, prev_log_index: Index, num_entries: usize) {
        let confirmed = prev_log_index.plus(num_entries as u64);

        // Stale successes (e.g. reordered delivery after a rewind) must not move either cursor
        // backwards, so both only ratchet forward.
        if confirmed > self.matched {
            self.matched = confirmed;
        }
        if num_entries > 0 && confirmed.plus(1) > self.next {
            self.next = confirmed.plus(1);
        }
    }

    fn rewind_log(&mut self, hint: Option<Index>) {
        let rewound = match hint {
            // Follower told us where its log diverges; jump straight there.
            Some(conflict_index) => conflict_index.max(Index::new(1)),
            None => Index::new(self.next.as_u64().saturating_sub(1).max(1)),
        };

        // Never rewind below what this peer has already confirmed replicated.
        self.next = rewound.max(self.matched.plus(1));
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// Returns true if the reply should be applied.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer_handle.reset_heartbeat_timer();
    }
}

#[derive(Debug)]
pub(crate) enum PeerReplyUpdate {
    Replicated {
        prev_log_index: Index,
        num_entries: usize,
    },
    Conflict {
        hint: Option<Index>,
    },
    CallFailed,
}

#[derive(Clone, Debug)]
pub(crate) enum ElectionStateSnapshot {
    Leader(Term),
    Candidate(Term),
    Follower(Term, Option<ReplicaId>),
}

fn state_change_channel(
    initial_state: ElectionStateSnapshot,
) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { snd }, ElectionStateChangeListener { rcv })
}

struct ElectionStateChangeNotifier {
    snd: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    fn notify_new_state(&self, new_state: ElectionStateSnapshot) {
        let _ = self.snd.send(new_state);
    }
}

#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rcv: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }
}
