use crate::actor::WeakActorClient;
use crate::api::{create_commit_stream, CommitStream, CommitStreamPublisher, CommittedEntry};
use crate::observer::RaftObserver;
use crate::replica::election::{
    CurrentLeader, ElectionConfig, ElectionState, ElectionStateChangeListener, PeerReplyUpdate,
};
use crate::replica::log::{Index, LogEntry, RaftLog};
use crate::replica::peers::{ClusterMembers, ReplicaId};
use crate::replica::persistent_state::{PersistentState, PersistentStorage, Term};
use crate::replica::replica_api::{
    AppendEntriesCallDescriptor, AppendEntriesReplyFromPeer, HeartbeatTick, ProposeError, ProposeInput, ProposeOutput,
    RequestVoteReplyFromPeer, RpcError,
};
use crate::transport::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTransport, ReplicatedEntry, RequestVoteRequest,
    RequestVoteResponse, TransportError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::{cmp, io};
use tokio::time::Duration;

pub(crate) struct ReplicaConfig<S: PersistentStorage> {
    pub logger: slog::Logger,
    pub cluster_members: ClusterMembers,
    pub storage: S,
    pub transport: Arc<dyn RaftTransport>,
    pub observer: Arc<dyn RaftObserver>,
    pub actor_client: WeakActorClient,
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
    pub append_entries_timeout: Duration,
}

pub(crate) fn create_replica<S: PersistentStorage>(
    config: ReplicaConfig<S>,
    restored: PersistentState,
) -> (Replica<S>, CommitStream, ElectionStateChangeListener) {
    let my_replica_id = config.cluster_members.me().clone();
    let (election_state, election_state_change_listener) = ElectionState::new_follower(
        ElectionConfig {
            my_replica_id: my_replica_id.clone(),
            leader_heartbeat_duration: config.leader_heartbeat_duration,
            election_min_timeout: config.election_min_timeout,
            election_max_timeout: config.election_max_timeout,
        },
        restored.current_term,
        config.actor_client.clone(),
    );
    let (commit_stream_publisher, commit_stream) = create_commit_stream();

    let replica = Replica {
        logger: config.logger,
        my_replica_id,
        members: config.cluster_members,
        current_term: restored.current_term,
        voted_for: restored.voted_for,
        log: restored.log,
        storage_dirty: false,
        commit_index: Index::new(0),
        last_applied: Index::new(0),
        election_state,
        storage: config.storage,
        transport: config.transport,
        observer: config.observer,
        commit_stream: commit_stream_publisher,
        actor_client: config.actor_client,
        append_entries_timeout: config.append_entries_timeout,
        pending_proposals: HashMap::new(),
        first_heartbeat_recorded: None,
    };

    (replica, commit_stream, election_state_change_listener)
}

pub(crate) struct Replica<S: PersistentStorage> {
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    members: ClusterMembers,

    // Persistent state. Mutations must reach `storage` before any acknowledgement that depends on
    // them leaves this replica. In-memory state may run ahead of disk after a failed save, but
    // never behind what we've acked.
    current_term: Term,
    voted_for: Option<ReplicaId>,
    log: RaftLog,
    // Set when in-memory state has run ahead of storage. While set, every handler must re-attempt
    // the save before sending a positive reply, even if the handler itself mutated nothing.
    storage_dirty: bool,

    // Volatile state, rebuilt after restart.
    commit_index: Index,
    last_applied: Index,

    election_state: ElectionState,
    storage: S,
    transport: Arc<dyn RaftTransport>,
    observer: Arc<dyn RaftObserver>,
    commit_stream: CommitStreamPublisher,
    actor_client: WeakActorClient,
    append_entries_timeout: Duration,

    // Leader-side: (index -> term) of proposals accepted on this replica, for the observer's
    // proposal_committed hook. Cleared on every leadership change.
    pending_proposals: HashMap<Index, Term>,
    first_heartbeat_recorded: Option<Term>,
}

impl<S: PersistentStorage> Replica<S> {
    pub(crate) fn handle_propose(&mut self, input: ProposeInput) -> Result<ProposeOutput, ProposeError> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader_id) => {
                return Err(ProposeError::NotLeader {
                    leader_hint: Some(leader_id),
                });
            }
            CurrentLeader::Unknown => {
                return Err(ProposeError::NotLeader { leader_hint: None });
            }
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.current_term;
        let appended_index = self.log.append(LogEntry {
            term,
            data: input.data,
        });
        self.storage_dirty = true;

        if let Err(ioe) = self.persist() {
            // The entry never became durable, so withdraw it rather than ack it.
            self.log.truncate_from(appended_index);
            return Err(ProposeError::StorageFailure(ioe));
        }

        slog::info!(
            self.logger,
            "Accepted proposal at index {:?} for term {:?}",
            appended_index,
            term,
        );
        self.observer.proposal_started(appended_index, term);
        self.pending_proposals.insert(appended_index, term);

        // Single-replica cluster: quorum is us alone.
        self.leader_advance_commit_index();

        // Nudge every peer's heartbeat to carry the new entry now instead of at the next period.
        for peer_id in self.members.peers() {
            self.spawn_heartbeat_tick(peer_id.clone(), term);
        }

        Ok(ProposeOutput {
            index: appended_index,
            term,
        })
    }

    pub(crate) fn handle_request_vote(&mut self, request: RequestVoteRequest) -> Result<RequestVoteResponse, RpcError> {
        if !self.members.contains(&request.candidate_id) {
            slog::warn!(
                self.logger,
                "RequestVote from unknown candidate {:?}. Not granting vote.",
                request.candidate_id,
            );
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // 1. Reply false if term < currentTerm (§5.1)
        if request.term < self.current_term {
            slog::info!(self.logger, "Not granting vote. Candidate term is out of date.");
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if request.term > self.current_term {
            self.current_term = request.term;
            self.voted_for = None;
            self.storage_dirty = true;
            self.election_state.transition_to_follower(self.current_term, None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Election state: {:?}",
                self.election_state,
            );
        }

        // 2. If votedFor is null or candidateId, and candidate's log is at
        // least as up-to-date as receiver's log, grant vote (§5.2, §5.4)
        let vote_available = match &self.voted_for {
            None => true,
            Some(id) => *id == request.candidate_id,
        };
        let vote_granted =
            vote_available && self.is_candidate_log_up_to_date(request.last_log_term, request.last_log_index);

        if vote_granted && self.voted_for.is_none() {
            self.voted_for = Some(request.candidate_id.clone());
            self.storage_dirty = true;
        }

        self.persist_if_dirty().map_err(RpcError::StorageFailure)?;

        if vote_granted {
            slog::info!(self.logger, "Voting for {:?} in term {:?}.", request.candidate_id, self.current_term);
        } else {
            slog::info!(self.logger, "Not granting vote to {:?}.", request.candidate_id);
        }

        // A granted vote does not reset the election deadline; only traffic from a current leader
        // does. Otherwise a candidate that can't win keeps suppressing elections here.
        Ok(RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        })
    }

    fn is_candidate_log_up_to_date(&self, candidate_last_term: Term, candidate_last_index: Index) -> bool {
        // > If the logs have last entries with different terms, then the log with the later term is
        // > more up-to-date. If the logs end with the same term, then whichever log is longer is
        // > more up-to-date. (§5.4.1)
        (candidate_last_term, candidate_last_index) >= (self.log.last_term(), self.log.last_index())
    }

    pub(crate) fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError> {
        // 1. Reply false if term < currentTerm (§5.1)
        if request.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_index: None,
            });
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if request.term > self.current_term {
            self.current_term = request.term;
            self.voted_for = None;
            self.storage_dirty = true;
            self.election_state
                .transition_to_follower(self.current_term, Some(request.leader_id.clone()));
        } else if self.election_state.is_candidate() {
            // Same term: another replica won the election we were running in.
            self.election_state
                .transition_to_follower(self.current_term, Some(request.leader_id.clone()));
        } else {
            self.election_state.set_leader_if_unknown(&request.leader_id);
        }

        // Valid traffic from the current leader.
        self.election_state.reset_timeout_if_follower();

        // 2. Reply false if log doesn't contain an entry at prevLogIndex
        // whose term matches prevLogTerm (§5.3)
        if request.prev_log_index > self.log.last_index() {
            // Conflict hint: our log length, i.e. the first index we don't have. Lets the leader
            // back off in one step instead of one index per round trip.
            let hint = self.log.last_index().plus(1);
            self.persist_if_dirty().map_err(RpcError::StorageFailure)?;
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_index: Some(hint),
            });
        }
        if let Some(my_prev_term) = self.log.term_at(request.prev_log_index) {
            if my_prev_term != request.prev_log_term {
                // Conflict hint: the first index of the term we hold at prevLogIndex. The whole
                // run of that term is suspect, so have the leader retry from its start.
                let mut hint = request.prev_log_index;
                while hint.as_u64() > 1 && self.log.term_at(Index::new(hint.as_u64() - 1)) == Some(my_prev_term) {
                    hint = Index::new(hint.as_u64() - 1);
                }
                self.persist_if_dirty().map_err(RpcError::StorageFailure)?;
                return Ok(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    conflict_index: Some(hint),
                });
            }
        }

        // 3. If an existing entry conflicts with a new one (same index but
        // different terms), delete the existing entry and all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        for (offset, incoming) in request.entries.iter().enumerate() {
            let index = request.prev_log_index.plus(offset as u64 + 1);
            match self.log.term_at(index) {
                Some(existing_term) if existing_term == incoming.term => {
                    // Already have it.
                    continue;
                }
                Some(_) => {
                    self.log.truncate_from(index);
                    self.log.append(LogEntry {
                        term: incoming.term,
                        data: incoming.data.clone(),
                    });
                    self.storage_dirty = true;
                }
                None => {
                    self.log.append(LogEntry {
                        term: incoming.term,
                        data: incoming.data.clone(),
                    });
                    self.storage_dirty = true;
                }
            }
        }

        // Trim any locally held tail past the last incoming entry; the leader's log is the truth
        // and anything we hold beyond it is superseded.
        if !request.entries.is_empty() {
            let last_incoming = request.prev_log_index.plus(request.entries.len() as u64);
            if self.log.last_index() > last_incoming {
                self.log.truncate_from(last_incoming.plus(1));
                self.storage_dirty = true;
            }
        }

        self.persist_if_dirty().map_err(RpcError::StorageFailure)?;

        // 5. If leaderCommit > commitIndex,
        // set commitIndex = min(leaderCommit, index of last new entry)
        if request.leader_commit > self.commit_index {
            self.commit_index = cmp::min(request.leader_commit, self.log.last_index());
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.apply_committed_entries();

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            conflict_index: None,
        })
    }

    pub(crate) fn handle_election_timeout(&mut self) {
        if self.election_state.is_leader() {
            // Stale timer from before we won.
            return;
        }

        if let CurrentLeader::Other(_) = self.election_state.current_leader() {
            self.observer.leader_lost(self.current_term);
        }

        // Write-ahead style: term and self-vote must be durable before soliciting votes.
        let previous = (self.current_term, self.voted_for.clone());
        self.current_term.incr();
        self.voted_for = Some(self.my_replica_id.clone());
        self.storage_dirty = true;

        if let Err(ioe) = self.persist() {
            slog::error!(self.logger, "Failed to persist self-vote, not starting election: {:?}", ioe);
            let (term, voted_for) = previous;
            self.current_term = term;
            self.voted_for = voted_for;
            // Stay a follower; the election timer fires again after its backoff.
            self.election_state.transition_to_follower(self.current_term, None);
            return;
        }

        let election_term = self.current_term;
        self.election_state.transition_to_candidate_and_vote_for_self(election_term);
        slog::info!(
            self.logger,
            "Election timeout. Starting election for term {:?}. Election state: {:?}",
            election_term,
            self.election_state,
        );
        self.observer.election_started(election_term);

        // Single-replica cluster: our own vote is already a majority.
        if self.members.majority() == 1 {
            self.become_leader();
            return;
        }

        let request = RequestVoteRequest {
            term: election_term,
            candidate_id: self.my_replica_id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer_id in self.members.peers() {
            tokio::task::spawn(Self::call_peer_request_vote(
                Arc::clone(&self.transport),
                peer_id.clone(),
                request.clone(),
                self.actor_client.clone(),
                election_term,
            ));
        }
    }

    async fn call_peer_request_vote(
        transport: Arc<dyn RaftTransport>,
        peer_id: ReplicaId,
        request: RequestVoteRequest,
        callback: WeakActorClient,
        term: Term,
    ) {
        let result = transport.request_vote(&peer_id, request).await;

        let _ = callback
            .request_vote_reply_from_peer(RequestVoteReplyFromPeer { peer_id, term, result })
            .await;
    }

    pub(crate) fn handle_request_vote_reply(&mut self, reply: RequestVoteReplyFromPeer) {
        if reply.term != self.current_term {
            slog::info!(
                self.logger,
                "Received vote reply for outdated term {:?}, current term: {:?}.",
                reply.term,
                self.current_term,
            );
            return;
        }

        let response = match reply.result {
            Ok(response) => response,
            Err(transport_error) => {
                // No retry here; if the election stalls, the candidate's own timer fires again
                // with a fresh term.
                slog::debug!(
                    self.logger,
                    "RequestVote call to {:?} failed: {}",
                    reply.peer_id,
                    transport_error,
                );
                return;
            }
        };

        if response.term > self.current_term {
            slog::info!(self.logger, "Vote reply carries newer term {:?}. Standing down.", response.term);
            self.step_down(response.term, None);
            return;
        }

        if !response.vote_granted {
            slog::info!(self.logger, "Vote not granted by {:?} for term {:?}.", reply.peer_id, reply.term);
            return;
        }

        let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
            Some(v) => v,
            None => {
                slog::info!(
                    self.logger,
                    "Received vote for term {:?} after leaving candidacy: {:?}",
                    reply.term,
                    self.election_state,
                );
                return;
            }
        };

        slog::info!(
            self.logger,
            "Received {}/{} votes for term {:?}",
            num_votes_received,
            self.members.num_members(),
            reply.term,
        );

        if num_votes_received >= self.members.majority() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        let term = self.current_term;
        self.pending_proposals.clear();
        self.election_state
            .transition_to_leader(term, self.members.peer_ids(), self.log.last_index().plus(1));
        slog::info!(self.logger, "Won election for term {:?}. Election state: {:?}", term, self.election_state);
        self.observer.leader_elected(term);
    }

    pub(crate) fn handle_heartbeat_tick(&mut self, tick: HeartbeatTick) {
        if tick.term != self.current_term {
            slog::debug!(
                self.logger,
                "Heartbeat tick for outdated term {:?}, current term: {:?}",
                tick.term,
                self.current_term,
            );
            return;
        }

        let current_term = self.current_term;
        let last_log_index = self.log.last_index();

        let (seq_no, next_index, prev_log_index) = {
            let leader_state = match self.election_state.leader_state_mut() {
                Some(ls) => ls,
                None => {
                    slog::info!(self.logger, "Heartbeat tick but no longer leader.");
                    return;
                }
            };
            let peer_state = match leader_state.peer_state_mut(&tick.peer_id) {
                Some(ps) => ps,
                None => {
                    slog::error!(self.logger, "Peer {:?} missing from leader state.", tick.peer_id);
                    return;
                }
            };

            // One outstanding AppendEntries per peer, no pipelining. Entries still batch, so this
            // caps only request concurrency, not throughput.
            if peer_state.has_outstanding_request() {
                slog::debug!(self.logger, "Outstanding AppendEntries to {:?}. Skipping tick.", tick.peer_id);
                return;
            }

            let next_index = peer_state.next_index();
            let seq_no = peer_state.next_seq_no();
            peer_state.reset_heartbeat_timer();

            (seq_no, next_index, Index::new(next_index.as_u64() - 1))
        };

        let prev_log_term = match self.log.term_at(prev_log_index) {
            Some(term) => term,
            None => {
                slog::error!(
                    self.logger,
                    "Leader state tracks next={:?} for {:?} but our log ends at {:?}.",
                    next_index,
                    tick.peer_id,
                    last_log_index,
                );
                return;
            }
        };

        // > If last log index >= nextIndex for a follower: send AppendEntries
        // > RPC with log entries starting at nextIndex (§5.3)
        let entries: Vec<ReplicatedEntry> = self
            .log
            .entries_from(next_index)
            .iter()
            .map(|entry| ReplicatedEntry {
                term: entry.term,
                data: entry.data.clone(),
            })
            .collect();

        let descriptor = AppendEntriesCallDescriptor {
            peer_id: tick.peer_id.clone(),
            term: current_term,
            seq_no,
            prev_log_index,
            num_entries: entries.len(),
        };
        let request = AppendEntriesRequest {
            term: current_term,
            leader_id: self.my_replica_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        if self.first_heartbeat_recorded != Some(current_term) {
            self.first_heartbeat_recorded = Some(current_term);
            self.observer.first_heartbeat(current_term);
        }

        tokio::task::spawn(Self::call_peer_append_entries(
            Arc::clone(&self.transport),
            tick.peer_id,
            request,
            self.append_entries_timeout,
            self.actor_client.clone(),
            descriptor,
        ));
    }

    async fn call_peer_append_entries(
        transport: Arc<dyn RaftTransport>,
        peer_id: ReplicaId,
        request: AppendEntriesRequest,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: AppendEntriesCallDescriptor,
    ) {
        let result = match tokio::time::timeout(rpc_timeout, transport.append_entries(&peer_id, request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(TransportError::Timeout),
        };

        let _ = callback
            .append_entries_reply_from_peer(AppendEntriesReplyFromPeer { descriptor, result })
            .await;
    }

    pub(crate) fn handle_append_entries_reply(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self.logger.new(slog::o!(
            "peer" => format!("{:?}", reply.descriptor.peer_id),
            "seq_no" => reply.descriptor.seq_no,
        ));

        if reply.descriptor.term != self.current_term {
            slog::info!(
                logger,
                "AppendEntries reply for outdated term {:?}, current term: {:?}",
                reply.descriptor.term,
                self.current_term,
            );
            return;
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if let Ok(response) = &reply.result {
            if response.term > self.current_term {
                slog::info!(logger, "Rejected by peer on newer term {:?}. Standing down.", response.term);
                self.step_down(response.term, None);
                return;
            }
        }

        let peer_update = match reply.result {
            Ok(response) if response.success => PeerReplyUpdate::Replicated {
                prev_log_index: reply.descriptor.prev_log_index,
                num_entries: reply.descriptor.num_entries,
            },
            Ok(response) => PeerReplyUpdate::Conflict {
                hint: response.conflict_index,
            },
            Err(transport_error) => {
                slog::debug!(logger, "AppendEntries call failed: {}", transport_error);
                PeerReplyUpdate::CallFailed
            }
        };

        let next_index = {
            let leader_state = match self.election_state.leader_state_mut() {
                Some(ls) => ls,
                None => {
                    slog::info!(logger, "No longer leader.");
                    return;
                }
            };
            let peer_state = match leader_state.peer_state_mut(&reply.descriptor.peer_id) {
                Some(ps) => ps,
                None => {
                    slog::warn!(logger, "Peer {:?} missing from leader state.", reply.descriptor.peer_id);
                    return;
                }
            };

            peer_state.record_reply(&logger, reply.descriptor.seq_no, peer_update);
            peer_state.next_index()
        };

        self.leader_advance_commit_index();

        // Keep the pipe full: if the peer is still behind, don't wait out the heartbeat period.
        if self.log.last_index() >= next_index {
            self.spawn_heartbeat_tick(reply.descriptor.peer_id, reply.descriptor.term);
        }
    }

    /// Recomputes the commit index from peers' confirmed replication.
    ///
    /// > If there exists an N such that N > commitIndex, a majority of
    /// > matchIndex[i] >= N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4)
    ///
    /// The term check is what makes Figure 8 of the paper safe: entries from older terms are never
    /// counted towards commitment directly, only by committing an entry of the current term on top.
    fn leader_advance_commit_index(&mut self) {
        let peers_matched = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state.peer_matched_indexes(),
            None => return,
        };

        let candidate = Self::quorum_matched_index(self.log.last_index(), peers_matched);
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            slog::debug!(self.logger, "Advancing commit index to {:?}", candidate);
            self.commit_index = candidate;
            self.apply_committed_entries();
        }
    }

    /// Largest index replicated on a majority of the cluster, our own log included.
    fn quorum_matched_index(my_last_index: Index, mut peers_matched: Vec<Index>) -> Index {
        peers_matched.push(my_last_index);
        peers_matched.sort_unstable();

        // With the list sorted ascending, the entry `majority` positions from the end is the
        // largest index that at least a majority of members have.
        let majority = peers_matched.len() / 2 + 1;
        peers_matched[peers_matched.len() - majority]
    }

    fn apply_committed_entries(&mut self) {
        while self.last_applied < self.commit_index {
            let apply_index = self.last_applied.plus(1);
            let entry = match self.log.entry(apply_index) {
                Some(entry) => entry,
                None => {
                    // commit_index never exceeds our log, so this is unreachable; bail rather
                    // than deliver a gap.
                    slog::error!(self.logger, "Committed entry {:?} missing from log.", apply_index);
                    return;
                }
            };
            let entry_term = entry.term;

            self.commit_stream.notify_commit(
                &self.logger,
                CommittedEntry {
                    valid: true,
                    index: apply_index,
                    data: entry.data.clone(),
                },
            );
            self.last_applied = apply_index;

            if let Some(proposed_term) = self.pending_proposals.remove(&apply_index) {
                if proposed_term == entry_term {
                    self.observer.proposal_committed(apply_index, entry_term);
                }
            }
        }
    }

    fn step_down(&mut self, new_term: Term, leader: Option<ReplicaId>) {
        self.current_term = new_term;
        self.voted_for = None;
        self.storage_dirty = true;
        if let Err(ioe) = self.persist() {
            // Still step down in memory; nothing is acked off the back of this mutation.
            slog::error!(self.logger, "Failed to persist term {:?} while standing down: {:?}", new_term, ioe);
        }
        self.election_state.transition_to_follower(new_term, leader);
    }

    pub(crate) fn handle_shut_down(&mut self) {
        let was_leader = self.election_state.is_leader();
        slog::info!(self.logger, "Shutting down. was_leader={}", was_leader);
        self.observer.shutting_down(was_leader);
    }

    fn spawn_heartbeat_tick(&self, peer_id: ReplicaId, term: Term) {
        let actor_client = self.actor_client.clone();
        tokio::task::spawn(async move {
            let _ = actor_client.heartbeat_tick(HeartbeatTick { peer_id, term }).await;
        });
    }

    fn persist(&mut self) -> io::Result<()> {
        let blob = PersistentState::encode(self.current_term, &self.voted_for, &self.log);
        self.storage.save(blob)?;
        self.storage_dirty = false;
        Ok(())
    }

    fn persist_if_dirty(&mut self) -> io::Result<()> {
        if self.storage_dirty {
            self.persist()
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::api::RaftEventListener;
    use crate::observer::NoOpObserver;
    use crate::replica::persistent_state::InMemoryStorage;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct UnreachableTransport;

    #[async_trait::async_trait]
    impl RaftTransport for UnreachableTransport {
        async fn request_vote(
            &self,
            _peer: &ReplicaId,
            _request: RequestVoteRequest,
        ) -> Result<RequestVoteResponse, TransportError> {
            Err(TransportError::Unreachable)
        }

        async fn append_entries(
            &self,
            _peer: &ReplicaId,
            _request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse, TransportError> {
            Err(TransportError::Unreachable)
        }
    }

    /// Delegates to an InMemoryStorage, but fails every save while the flag is raised. Loads
    /// always pass through, so tests can assert what actually made it to "disk".
    struct FailableStorage {
        inner: InMemoryStorage,
        fail_saves: Arc<AtomicBool>,
    }

    impl PersistentStorage for FailableStorage {
        fn save(&mut self, blob: Bytes) -> io::Result<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "injected save failure"));
            }
            self.inner.save(blob)
        }

        fn load(&self) -> io::Result<Option<Bytes>> {
            self.inner.load()
        }
    }

    struct Fixture<S: PersistentStorage> {
        replica: Replica<S>,
        commit_stream: CommitStream,
        // The in-memory buffer backing the replica's storage, for durability assertions.
        storage: InMemoryStorage,
        // Kept alive so WeakActorClient sends from spawned tasks don't fail mid-test.
        _actor_client: ActorClient,
        _actor_queue_rx: tokio::sync::mpsc::Receiver<crate::actor::Event>,
        _event_listener: RaftEventListener,
    }

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn create_fixture_with_storage<S: PersistentStorage>(
        me: &str,
        members: &[&str],
        restored: PersistentState,
        storage: S,
        backing: InMemoryStorage,
    ) -> Fixture<S> {
        let all: Vec<ReplicaId> = members.iter().map(|m| ReplicaId::new(*m)).collect();
        let cluster_members = ClusterMembers::new(ReplicaId::new(me), all).unwrap();
        let (actor_client, actor_queue_rx) = ActorClient::new(64);

        let (replica, commit_stream, election_listener) = create_replica(
            ReplicaConfig {
                logger: test_logger(),
                cluster_members,
                storage,
                transport: Arc::new(UnreachableTransport),
                observer: Arc::new(NoOpObserver),
                actor_client: actor_client.weak(),
                // Real timers, far enough out to never fire during a test.
                leader_heartbeat_duration: Duration::from_secs(1800),
                election_min_timeout: Duration::from_secs(3600),
                election_max_timeout: Duration::from_secs(7200),
                append_entries_timeout: Duration::from_secs(1800),
            },
            restored,
        );

        Fixture {
            replica,
            commit_stream,
            storage: backing,
            _actor_client: actor_client,
            _actor_queue_rx: actor_queue_rx,
            _event_listener: RaftEventListener::new(election_listener),
        }
    }

    fn create_fixture(me: &str, members: &[&str], restored: PersistentState) -> Fixture<InMemoryStorage> {
        let mut storage = InMemoryStorage::new();
        // The restored state is what a real replica would have loaded from storage, so seed the
        // backing store with it: durability-reading tests start from a persisted baseline.
        storage
            .save(PersistentState::encode(restored.current_term, &restored.voted_for, &restored.log))
            .unwrap();
        create_fixture_with_storage(me, members, restored, storage.clone(), storage)
    }

    fn fresh_fixture(me: &str, members: &[&str]) -> Fixture<InMemoryStorage> {
        create_fixture(me, members, PersistentState::fresh())
    }

    fn failing_storage_fixture(
        me: &str,
        members: &[&str],
        restored: PersistentState,
    ) -> (Fixture<FailableStorage>, Arc<AtomicBool>) {
        let backing = InMemoryStorage::new();
        let fail_saves = Arc::new(AtomicBool::new(false));
        let storage = FailableStorage {
            inner: backing.clone(),
            fail_saves: Arc::clone(&fail_saves),
        };
        let fixture = create_fixture_with_storage(me, members, restored, storage, backing);
        (fixture, fail_saves)
    }

    fn restored_state(term: u64, voted_for: Option<&str>, entry_terms: &[u64]) -> PersistentState {
        let mut log = RaftLog::new();
        for (i, t) in entry_terms.iter().enumerate() {
            log.append(LogEntry {
                term: Term::new(*t),
                data: Bytes::from(format!("entry-{}", i + 1)),
            });
        }
        PersistentState {
            current_term: Term::new(term),
            voted_for: voted_for.map(ReplicaId::new),
            log,
        }
    }

    fn vote_request(term: u64, candidate: &str, last_log_index: u64, last_log_term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term: Term::new(term),
            candidate_id: ReplicaId::new(candidate),
            last_log_index: Index::new(last_log_index),
            last_log_term: Term::new(last_log_term),
        }
    }

    fn append_request(
        term: u64,
        leader: &str,
        prev_index: u64,
        prev_term: u64,
        entry_terms: &[u64],
        leader_commit: u64,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: Term::new(term),
            leader_id: ReplicaId::new(leader),
            prev_log_index: Index::new(prev_index),
            prev_log_term: Term::new(prev_term),
            entries: entry_terms
                .iter()
                .enumerate()
                .map(|(i, t)| ReplicatedEntry {
                    term: Term::new(*t),
                    data: Bytes::from(format!("incoming-{}", prev_index + i as u64 + 1)),
                })
                .collect(),
            leader_commit: Index::new(leader_commit),
        }
    }

    fn persisted_state<S: PersistentStorage>(fixture: &Fixture<S>) -> PersistentState {
        PersistentState::decode(fixture.storage.load().unwrap().expect("nothing persisted"))
            .expect("persisted blob should decode")
    }

    async fn assert_next_commit<S: PersistentStorage>(fixture: &mut Fixture<S>, expected_index: u64) -> Bytes {
        let committed = tokio::time::timeout(Duration::from_secs(5), fixture.commit_stream.next())
            .await
            .expect("expected a committed entry")
            .expect("commit stream closed");
        assert!(committed.valid);
        assert_eq!(committed.index, Index::new(expected_index));
        committed.data
    }

    async fn assert_no_commit<S: PersistentStorage>(fixture: &mut Fixture<S>) {
        tokio::time::timeout(Duration::from_millis(50), fixture.commit_stream.next())
            .await
            .expect_err("expected no committed entry");
    }

    #[tokio::test]
    async fn propose_rejected_when_not_leader() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);

        let result = fixture.replica.handle_propose(ProposeInput {
            data: Bytes::from_static(b"cmd"),
        });

        assert!(matches!(result, Err(ProposeError::NotLeader { leader_hint: None })));

        // Learn the leader from its AppendEntries, then redirect to it.
        fixture
            .replica
            .handle_append_entries(append_request(1, "b", 0, 0, &[], 0))
            .unwrap();
        let result = fixture.replica.handle_propose(ProposeInput {
            data: Bytes::from_static(b"cmd"),
        });
        match result {
            Err(ProposeError::NotLeader { leader_hint: Some(id) }) => assert_eq!(id, ReplicaId::new("b")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn request_vote_grants_and_persists() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);

        let response = fixture.replica.handle_request_vote(vote_request(1, "b", 0, 0)).unwrap();

        assert!(response.vote_granted);
        assert_eq!(response.term, Term::new(1));

        let persisted = persisted_state(&fixture);
        assert_eq!(persisted.current_term, Term::new(1));
        assert_eq!(persisted.voted_for, Some(ReplicaId::new("b")));
    }

    #[tokio::test]
    async fn request_vote_one_vote_per_term() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);

        assert!(fixture.replica.handle_request_vote(vote_request(1, "b", 0, 0)).unwrap().vote_granted);
        // Second candidate, same term: no.
        assert!(!fixture.replica.handle_request_vote(vote_request(1, "c", 0, 0)).unwrap().vote_granted);
        // Same candidate retries: still yes.
        assert!(fixture.replica.handle_request_vote(vote_request(1, "b", 0, 0)).unwrap().vote_granted);
        // Higher term: vote is available again.
        assert!(fixture.replica.handle_request_vote(vote_request(2, "c", 0, 0)).unwrap().vote_granted);
    }

    #[tokio::test]
    async fn request_vote_rejects_stale_term() {
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(5, None, &[]));

        let response = fixture.replica.handle_request_vote(vote_request(4, "b", 0, 0)).unwrap();

        assert!(!response.vote_granted);
        assert_eq!(response.term, Term::new(5));
    }

    #[tokio::test]
    async fn request_vote_rejects_out_of_date_log() {
        // Our log: terms [1, 2, 2], last entry (term 2, index 3).
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(2, None, &[1, 2, 2]));

        // Candidate's last entry has an older term.
        assert!(!fixture.replica.handle_request_vote(vote_request(3, "b", 5, 1)).unwrap().vote_granted);
        // Same term, shorter log.
        assert!(!fixture.replica.handle_request_vote(vote_request(3, "b", 2, 2)).unwrap().vote_granted);
        // Vote wasn't burned on the rejections; an up-to-date candidate still gets it.
        assert!(fixture.replica.handle_request_vote(vote_request(3, "c", 3, 2)).unwrap().vote_granted);
    }

    #[tokio::test]
    async fn append_entries_rejects_stale_term() {
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(5, None, &[]));

        let response = fixture
            .replica
            .handle_append_entries(append_request(4, "b", 0, 0, &[], 0))
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.term, Term::new(5));
        assert_eq!(response.conflict_index, None);
    }

    #[tokio::test]
    async fn append_entries_conflict_hint_when_prev_beyond_end() {
        // Local log has 2 entries; leader assumes we have 5.
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(1, None, &[1, 1]));

        let response = fixture
            .replica
            .handle_append_entries(append_request(1, "b", 5, 1, &[1], 0))
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.conflict_index, Some(Index::new(3)));
    }

    #[tokio::test]
    async fn append_entries_conflict_hint_scans_to_first_index_of_term() {
        // Local terms: [1, 2, 2, 2]. Leader's prev at index 4 has term 3.
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(3, None, &[1, 2, 2, 2]));

        let response = fixture
            .replica
            .handle_append_entries(append_request(3, "b", 4, 3, &[], 0))
            .unwrap();

        assert!(!response.success);
        // The whole run of term 2 starts at index 2.
        assert_eq!(response.conflict_index, Some(Index::new(2)));
    }

    #[tokio::test]
    async fn append_entries_merges_truncating_conflicts() {
        // Local terms: [1, 1, 2]. Leader sends entries for indexes 2..=3 with terms [1, 3].
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(3, None, &[1, 1, 2]));

        let response = fixture
            .replica
            .handle_append_entries(append_request(3, "b", 1, 1, &[1, 3], 0))
            .unwrap();

        assert!(response.success);
        let persisted = persisted_state(&fixture);
        assert_eq!(persisted.log.last_index(), Index::new(3));
        assert_eq!(persisted.log.term_at(Index::new(1)), Some(Term::new(1)));
        assert_eq!(persisted.log.term_at(Index::new(2)), Some(Term::new(1)));
        assert_eq!(persisted.log.term_at(Index::new(3)), Some(Term::new(3)));
    }

    #[tokio::test]
    async fn append_entries_trims_superseded_tail() {
        // Local terms: [1, 1, 1, 1]. Leader replaces index 2 with term 2 and sends nothing after.
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(2, None, &[1, 1, 1, 1]));

        let response = fixture
            .replica
            .handle_append_entries(append_request(2, "b", 1, 1, &[2], 0))
            .unwrap();

        assert!(response.success);
        let persisted = persisted_state(&fixture);
        assert_eq!(persisted.log.last_index(), Index::new(2));
        assert_eq!(persisted.log.term_at(Index::new(2)), Some(Term::new(2)));
    }

    #[tokio::test]
    async fn append_entries_heartbeat_does_not_truncate() {
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(1, None, &[1, 1, 1]));

        let response = fixture
            .replica
            .handle_append_entries(append_request(1, "b", 1, 1, &[], 0))
            .unwrap();

        assert!(response.success);
        assert_eq!(persisted_state(&fixture).log.last_index(), Index::new(3));
    }

    #[tokio::test]
    async fn append_entries_advances_commit_and_applies_in_order() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);

        let response = fixture
            .replica
            .handle_append_entries(append_request(1, "b", 0, 0, &[1, 1, 1], 2))
            .unwrap();
        assert!(response.success);

        assert_next_commit(&mut fixture, 1).await;
        assert_next_commit(&mut fixture, 2).await;
        // Index 3 is not committed yet.
        assert_no_commit(&mut fixture).await;

        // Commit capped by our log length even if the leader is further ahead.
        fixture
            .replica
            .handle_append_entries(append_request(1, "b", 3, 1, &[], 9))
            .unwrap();
        assert_next_commit(&mut fixture, 3).await;
        assert_no_commit(&mut fixture).await;
    }

    #[tokio::test]
    async fn append_entries_apply_is_idempotent() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);

        let request = append_request(1, "b", 0, 0, &[1], 1);
        fixture.replica.handle_append_entries(request.clone()).unwrap();
        fixture.replica.handle_append_entries(request).unwrap();

        assert_next_commit(&mut fixture, 1).await;
        assert_no_commit(&mut fixture).await;
    }

    #[tokio::test]
    async fn election_timeout_starts_persisted_election() {
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(4, Some("b"), &[]));

        fixture.replica.handle_election_timeout();

        let persisted = persisted_state(&fixture);
        assert_eq!(persisted.current_term, Term::new(5));
        assert_eq!(persisted.voted_for, Some(ReplicaId::new("a")));
        assert!(fixture.replica.election_state.is_candidate());
    }

    #[tokio::test]
    async fn vote_majority_becomes_leader() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);
        fixture.replica.handle_election_timeout();
        let election_term = fixture.replica.current_term;

        // First peer vote: 2/3 of the cluster.
        fixture.replica.handle_request_vote_reply(RequestVoteReplyFromPeer {
            peer_id: ReplicaId::new("b"),
            term: election_term,
            result: Ok(RequestVoteResponse {
                term: election_term,
                vote_granted: true,
            }),
        });

        assert!(fixture.replica.election_state.is_leader());
        // A leader accepts proposals.
        let output = fixture
            .replica
            .handle_propose(ProposeInput {
                data: Bytes::from_static(b"cmd"),
            })
            .unwrap();
        assert_eq!(output.index, Index::new(1));
        assert_eq!(output.term, election_term);
    }

    #[tokio::test]
    async fn denied_votes_do_not_elect() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);
        fixture.replica.handle_election_timeout();
        let election_term = fixture.replica.current_term;

        for peer in &["b", "c"] {
            fixture.replica.handle_request_vote_reply(RequestVoteReplyFromPeer {
                peer_id: ReplicaId::new(*peer),
                term: election_term,
                result: Ok(RequestVoteResponse {
                    term: election_term,
                    vote_granted: false,
                }),
            });
        }

        assert!(fixture.replica.election_state.is_candidate());
    }

    #[tokio::test]
    async fn stale_term_vote_reply_is_ignored() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);
        fixture.replica.handle_election_timeout();

        fixture.replica.handle_request_vote_reply(RequestVoteReplyFromPeer {
            peer_id: ReplicaId::new("b"),
            term: Term::new(99),
            result: Ok(RequestVoteResponse {
                term: Term::new(99),
                vote_granted: true,
            }),
        });

        assert!(!fixture.replica.election_state.is_leader());
    }

    #[tokio::test]
    async fn vote_reply_with_newer_term_stands_down() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);
        fixture.replica.handle_election_timeout();
        let election_term = fixture.replica.current_term;

        fixture.replica.handle_request_vote_reply(RequestVoteReplyFromPeer {
            peer_id: ReplicaId::new("b"),
            term: election_term,
            result: Ok(RequestVoteResponse {
                term: Term::new(election_term.as_u64() + 3),
                vote_granted: false,
            }),
        });

        assert!(!fixture.replica.election_state.is_candidate());
        assert_eq!(persisted_state(&fixture).current_term, Term::new(election_term.as_u64() + 3));
    }

    #[tokio::test]
    async fn single_replica_cluster_proposes_and_commits_alone() {
        let mut fixture = fresh_fixture("a", &["a"]);

        fixture.replica.handle_election_timeout();
        assert!(fixture.replica.election_state.is_leader());

        let output = fixture
            .replica
            .handle_propose(ProposeInput {
                data: Bytes::from_static(b"solo"),
            })
            .unwrap();
        assert_eq!(output.index, Index::new(1));

        let data = assert_next_commit(&mut fixture, 1).await;
        assert_eq!(data, Bytes::from_static(b"solo"));
    }

    #[tokio::test]
    async fn leader_commits_after_quorum_replication() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);
        fixture.replica.handle_election_timeout();
        let term = fixture.replica.current_term;
        fixture.replica.handle_request_vote_reply(RequestVoteReplyFromPeer {
            peer_id: ReplicaId::new("b"),
            term,
            result: Ok(RequestVoteResponse {
                term,
                vote_granted: true,
            }),
        });
        assert!(fixture.replica.election_state.is_leader());

        fixture
            .replica
            .handle_propose(ProposeInput {
                data: Bytes::from_static(b"cmd"),
            })
            .unwrap();

        // Issue the AppendEntries to peer b, then feed its successful reply back.
        fixture.replica.handle_heartbeat_tick(HeartbeatTick {
            peer_id: ReplicaId::new("b"),
            term,
        });
        assert_no_commit(&mut fixture).await;

        fixture.replica.handle_append_entries_reply(AppendEntriesReplyFromPeer {
            descriptor: AppendEntriesCallDescriptor {
                peer_id: ReplicaId::new("b"),
                term,
                seq_no: 1,
                prev_log_index: Index::new(0),
                num_entries: 1,
            },
            result: Ok(AppendEntriesResponse {
                term,
                success: true,
                conflict_index: None,
            }),
        });

        // 2/3 replicas (leader + b) hold index 1: committed.
        assert_next_commit(&mut fixture, 1).await;
    }

    #[tokio::test]
    async fn leader_does_not_commit_old_term_entries_by_count_alone() {
        // Figure 8 of the paper: an entry from an older term never commits on majority count
        // alone, only by committing a current-term entry on top of it.
        let mut fixture = create_fixture("a", &["a", "b", "c"], restored_state(1, None, &[1]));
        fixture.replica.handle_election_timeout();
        let term = fixture.replica.current_term;
        assert_eq!(term, Term::new(2));
        fixture.replica.handle_request_vote_reply(RequestVoteReplyFromPeer {
            peer_id: ReplicaId::new("b"),
            term,
            result: Ok(RequestVoteResponse {
                term,
                vote_granted: true,
            }),
        });
        assert!(fixture.replica.election_state.is_leader());

        // Peer b confirms replication of the term-1 entry at index 1.
        fixture.replica.handle_heartbeat_tick(HeartbeatTick {
            peer_id: ReplicaId::new("b"),
            term,
        });
        fixture.replica.handle_append_entries_reply(AppendEntriesReplyFromPeer {
            descriptor: AppendEntriesCallDescriptor {
                peer_id: ReplicaId::new("b"),
                term,
                seq_no: 1,
                prev_log_index: Index::new(0),
                num_entries: 1,
            },
            result: Ok(AppendEntriesResponse {
                term,
                success: true,
                conflict_index: None,
            }),
        });

        // Majority holds index 1, but its term isn't current: no commit.
        assert_no_commit(&mut fixture).await;

        // Propose a current-term entry and replicate it too.
        fixture
            .replica
            .handle_propose(ProposeInput {
                data: Bytes::from_static(b"cmd"),
            })
            .unwrap();
        fixture.replica.handle_heartbeat_tick(HeartbeatTick {
            peer_id: ReplicaId::new("b"),
            term,
        });
        fixture.replica.handle_append_entries_reply(AppendEntriesReplyFromPeer {
            descriptor: AppendEntriesCallDescriptor {
                peer_id: ReplicaId::new("b"),
                term,
                seq_no: 2,
                prev_log_index: Index::new(1),
                num_entries: 1,
            },
            result: Ok(AppendEntriesResponse {
                term,
                success: true,
                conflict_index: None,
            }),
        });

        // Committing index 2 (current term) commits index 1 with it.
        assert_next_commit(&mut fixture, 1).await;
        assert_next_commit(&mut fixture, 2).await;
    }

    #[tokio::test]
    async fn candidate_yields_to_leader_of_same_term() {
        let mut fixture = fresh_fixture("a", &["a", "b", "c"]);
        fixture.replica.handle_election_timeout();
        let term = fixture.replica.current_term;
        assert!(fixture.replica.election_state.is_candidate());

        let response = fixture
            .replica
            .handle_append_entries(append_request(term.as_u64(), "b", 0, 0, &[], 0))
            .unwrap();

        assert!(response.success);
        assert!(!fixture.replica.election_state.is_candidate());
        assert_eq!(
            fixture.replica.election_state.current_leader(),
            CurrentLeader::Other(ReplicaId::new("b"))
        );
    }

    #[test]
    fn quorum_matched_index_math() {
        fn run(expected: u64, my_last: u64, peers: Vec<u64>) {
            let peers = peers.into_iter().map(Index::new).collect();
            assert_eq!(
                Index::new(expected),
                Replica::<InMemoryStorage>::quorum_matched_index(Index::new(my_last), peers),
            );
        }

        // 1-cluster
        run(9, 9, vec![]);

        // 3-cluster
        run(0, 9, vec![0, 0]);
        run(9, 9, vec![0, 9]);
        run(9, 9, vec![8, 9]);
        run(8, 9, vec![8, 0]);

        // 5-cluster
        run(0, 9, vec![0, 0, 0, 0]);
        run(0, 9, vec![0, 0, 0, 9]);
        run(8, 9, vec![0, 0, 8, 9]);
        run(8, 9, vec![0, 7, 8, 9]);
        run(8, 9, vec![6, 7, 8, 9]);

        // Ordering doesn't matter
        run(9, 9, vec![9, 8]);
        run(7, 9, vec![9, 8, 0, 0, 7]);
    }

    #[tokio::test]
    async fn request_vote_not_granted_until_vote_is_durable() {
        let (mut fixture, fail_saves) = failing_storage_fixture("a", &["a", "b", "c"], PersistentState::fresh());
        fail_saves.store(true, Ordering::SeqCst);

        let result = fixture.replica.handle_request_vote(vote_request(1, "b", 0, 0));
        assert!(matches!(result, Err(RpcError::StorageFailure(_))));
        assert!(fixture.storage.load().unwrap().is_none());

        // The candidate retries the identical call. The in-memory vote from the failed attempt
        // must not be handed out while it still isn't on disk.
        let result = fixture.replica.handle_request_vote(vote_request(1, "b", 0, 0));
        assert!(matches!(result, Err(RpcError::StorageFailure(_))));
        assert!(fixture.storage.load().unwrap().is_none());

        // Storage recovers: the same retry now persists and gets the vote.
        fail_saves.store(false, Ordering::SeqCst);
        let response = fixture.replica.handle_request_vote(vote_request(1, "b", 0, 0)).unwrap();
        assert!(response.vote_granted);
        let persisted = persisted_state(&fixture);
        assert_eq!(persisted.current_term, Term::new(1));
        assert_eq!(persisted.voted_for, Some(ReplicaId::new("b")));
    }

    #[tokio::test]
    async fn append_entries_not_acked_until_entries_are_durable() {
        let (mut fixture, fail_saves) = failing_storage_fixture("a", &["a", "b", "c"], PersistentState::fresh());
        fail_saves.store(true, Ordering::SeqCst);

        let request = append_request(1, "b", 0, 0, &[1], 0);
        let result = fixture.replica.handle_append_entries(request.clone());
        assert!(matches!(result, Err(RpcError::StorageFailure(_))));
        assert!(fixture.storage.load().unwrap().is_none());

        // Retry of the identical call must not be acked off the still-unpersisted entry.
        let result = fixture.replica.handle_append_entries(request.clone());
        assert!(matches!(result, Err(RpcError::StorageFailure(_))));
        assert!(fixture.storage.load().unwrap().is_none());

        fail_saves.store(false, Ordering::SeqCst);
        let response = fixture.replica.handle_append_entries(request).unwrap();
        assert!(response.success);
        let persisted = persisted_state(&fixture);
        assert_eq!(persisted.current_term, Term::new(1));
        assert_eq!(persisted.log.last_index(), Index::new(1));
    }

    #[tokio::test]
    async fn propose_withdraws_entry_when_persist_fails() {
        let (mut fixture, fail_saves) = failing_storage_fixture("a", &["a"], PersistentState::fresh());

        fixture.replica.handle_election_timeout();
        assert!(fixture.replica.election_state.is_leader());

        fail_saves.store(true, Ordering::SeqCst);
        let result = fixture.replica.handle_propose(ProposeInput {
            data: Bytes::from_static(b"lost"),
        });
        assert!(matches!(result, Err(ProposeError::StorageFailure(_))));
        assert_no_commit(&mut fixture).await;

        // The withdrawn entry's index is reused once storage recovers.
        fail_saves.store(false, Ordering::SeqCst);
        let output = fixture
            .replica
            .handle_propose(ProposeInput {
                data: Bytes::from_static(b"kept"),
            })
            .unwrap();
        assert_eq!(output.index, Index::new(1));
        let data = assert_next_commit(&mut fixture, 1).await;
        assert_eq!(data, Bytes::from_static(b"kept"));
    }

    #[tokio::test]
    async fn election_timeout_without_durable_self_vote_stays_follower() {
        let (mut fixture, fail_saves) = failing_storage_fixture("a", &["a", "b", "c"], restored_state(4, Some("b"), &[]));
        fail_saves.store(true, Ordering::SeqCst);

        fixture.replica.handle_election_timeout();

        assert!(!fixture.replica.election_state.is_candidate());
        assert_eq!(fixture.replica.current_term, Term::new(4));
        assert!(fixture.storage.load().unwrap().is_none());

        fail_saves.store(false, Ordering::SeqCst);
        fixture.replica.handle_election_timeout();

        assert!(fixture.replica.election_state.is_candidate());
        let persisted = persisted_state(&fixture);
        assert_eq!(persisted.current_term, Term::new(5));
        assert_eq!(persisted.voted_for, Some(ReplicaId::new("a")));
    }
}
