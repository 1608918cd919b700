//! # node
//!
//! why: define the raft node state machine and its state transitions
//! relations: uses log.rs for durable state, message.rs for rpc types; driven by server.rs
//! what: NodeState, RaftNode (election, replication, commit), Status, Output

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::gossip::Liveness;
use crate::log::{Index, LogEntry, RaftLog, Term};
use crate::message::{Envelope, RaftMessage};
use crate::storage::Storage;

/// A node identifier, unique within the cluster.
pub type NodeId = u64;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// A snapshot of a node's externally visible state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_log_index: Index,
    /// A leader that has not heard from a quorum within its lease reports
    /// false here. Always false on non-leaders.
    pub authoritative: bool,
    /// Peers the gossip layer currently suspects.
    pub suspected: Vec<NodeId>,
}

/// Volatile state that only exists while leading. Reset on every accession.
#[derive(Debug, Clone, Default)]
struct LeaderState {
    next_index: HashMap<NodeId, Index>,
    match_index: HashMap<NodeId, Index>,
    /// Heartbeat rounds sent in this term.
    round: u64,
    /// Round in which each peer last answered an AppendEntries.
    last_ack: HashMap<NodeId, u64>,
}

/// What the caller must do after stepping a message into the node.
#[derive(Debug, Default)]
pub struct Output {
    /// Messages to send.
    pub messages: Vec<Envelope>,
    /// A valid leader or a granted vote was seen: restart the election timer.
    pub reset_election_timer: bool,
    /// The node just won an election and must assert leadership at once.
    pub became_leader: bool,
}

/// A single Raft node in the cluster.
///
/// The node is a sans-io state machine: it never touches the network or a
/// clock. Callers feed it messages and timer expiries and send the messages
/// it hands back. Durable state lives in the log, which writes through to
/// storage before any reply depending on it is produced.
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// All cluster members, including this node
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    state: NodeState,
    log: RaftLog,
    last_applied: Index,
    leader_id: Option<NodeId>,
    /// Votes received in the current election (candidates only)
    votes_received: Vec<NodeId>,
    leader: Option<LeaderState>,
    liveness: HashMap<NodeId, Liveness>,
    /// Set when a write failed; nothing is acknowledged until storage
    /// accepts a write again.
    storage_failed: bool,
}

impl RaftNode {
    /// Creates a node from whatever the storage holds: a fresh follower in
    /// term 0 on empty storage, or the persisted term, vote, log and commit
    /// index after a restart.
    pub fn new(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        storage: Box<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        let mut cluster_nodes = cluster_nodes;
        if !cluster_nodes.contains(&id) {
            cluster_nodes.push(id);
        }
        cluster_nodes.sort_unstable();
        cluster_nodes.dedup();
        let log = RaftLog::new(storage)?;
        let (term, voted_for) = log.term_vote();
        info!(node_id = id, term, ?voted_for, last_index = log.last_index(), "starting node");
        Ok(Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            log,
            last_applied: 0,
            leader_id: None,
            votes_received: Vec::new(),
            leader: None,
            liveness: HashMap::new(),
            storage_failed: false,
        })
    }

    // -- accessors --

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn current_term(&self) -> Term {
        self.log.term_vote().0
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.log.term_vote().1
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> Index {
        self.log.commit_index()
    }

    pub fn last_applied(&self) -> Index {
        self.last_applied
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn votes_received(&self) -> &[NodeId] {
        &self.votes_received
    }

    pub fn last_log_index(&self) -> Index {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: Index) -> Option<&LogEntry> {
        self.log.get(index)
    }

    pub fn get_term_at(&self, index: Index) -> Term {
        self.log.term_at(index)
    }

    /// Leader's next index for a peer. None unless leading.
    pub fn next_index(&self, peer: NodeId) -> Option<Index> {
        self.leader.as_ref()?.next_index.get(&peer).copied()
    }

    /// Leader's match index for a peer. None unless leading.
    pub fn match_index(&self, peer: NodeId) -> Option<Index> {
        self.leader.as_ref()?.match_index.get(&peer).copied()
    }

    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    /// Majority of the static cluster membership.
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn storage_healthy(&self) -> bool {
        !self.storage_failed
    }

    // -- storage health --

    /// Fails fast while storage is known broken, unless a probe write
    /// shows it has recovered.
    fn check_storage(&mut self) -> Result<()> {
        if self.storage_failed {
            self.log.sync()?;
            info!(node_id = self.id, "storage accepts writes again");
            self.storage_failed = false;
        }
        Ok(())
    }

    /// Latches a storage failure. A leader or candidate that can't write
    /// gives up its role in memory, so it stops sending heartbeats and the
    /// rest of the cluster can elect a replacement.
    fn note_storage<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(RaftError::StorageFailure(_))) {
            self.storage_failed = true;
            if self.state != NodeState::Follower {
                warn!(
                    node_id = self.id,
                    term = self.current_term(),
                    from = %self.state,
                    "storage failed, giving up role"
                );
                self.state = NodeState::Follower;
                self.leader_id = None;
                self.votes_received.clear();
                self.leader = None;
            }
        }
        result
    }

    pub fn status(&self) -> Status {
        let mut suspected: Vec<NodeId> = self
            .liveness
            .iter()
            .filter(|(_, l)| **l == Liveness::Suspected)
            .map(|(id, _)| *id)
            .collect();
        suspected.sort_unstable();
        Status {
            id: self.id,
            role: self.state,
            term: self.current_term(),
            leader_id: self.leader_id,
            commit_index: self.commit_index(),
            last_applied: self.last_applied,
            last_log_index: self.last_log_index(),
            authoritative: self.is_authoritative(),
            suspected,
        }
    }

    // -- liveness hints --

    /// Replaces the gossip layer's liveness view. Advisory only: it orders
    /// vote solicitation and feeds status, never the quorum.
    pub fn set_liveness(&mut self, liveness: HashMap<NodeId, Liveness>) {
        self.liveness = liveness;
    }

    /// Peers to solicit votes from: believed-alive peers first, then peers
    /// with no gossip record, then suspected ones.
    pub fn vote_targets(&self) -> Vec<NodeId> {
        let rank = |peer: &NodeId| match self.liveness.get(peer) {
            Some(Liveness::Alive) => 0,
            None | Some(Liveness::Unknown) => 1,
            Some(Liveness::Suspected) => 2,
        };
        let mut peers: Vec<NodeId> = self.peers().collect();
        peers.sort_by_key(|p| (rank(p), *p));
        peers
    }

    // -- role transitions --

    /// Moves to follower. A higher term is persisted (clearing the vote)
    /// before anything else changes.
    pub fn become_follower(&mut self, term: Term) -> Result<()> {
        let current = self.current_term();
        if term > current {
            self.log.set_term_vote(term, None)?;
            self.leader_id = None;
        }
        if self.state != NodeState::Follower {
            info!(node_id = self.id, term = self.current_term(), from = %self.state, "stepping down");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.leader = None;
        Ok(())
    }

    /// Starts an election: bumps the term, votes for ourselves and returns
    /// the VoteRequest to broadcast to `vote_targets()`.
    pub fn start_election(&mut self) -> Result<RaftMessage> {
        let term = self.current_term() + 1;
        self.log.set_term_vote(term, Some(self.id))?;
        self.state = NodeState::Candidate;
        self.leader_id = None;
        self.leader = None;
        self.votes_received = vec![self.id];
        info!(node_id = self.id, term, "starting election");

        let request = RaftMessage::VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        if self.has_quorum() {
            self.become_leader()?;
        }
        Ok(request)
    }

    fn become_leader(&mut self) -> Result<()> {
        let next = self.last_log_index() + 1;
        let peers: Vec<NodeId> = self.peers().collect();
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.leader = Some(LeaderState {
            next_index: peers.iter().map(|&p| (p, next)).collect(),
            match_index: peers.iter().map(|&p| (p, 0)).collect(),
            round: 0,
            last_ack: HashMap::new(),
        });
        info!(node_id = self.id, term = self.current_term(), "became leader");

        // entries from earlier terms commit only behind one from this term
        self.log.append_command(Vec::new())?;
        self.maybe_commit()?;
        Ok(())
    }

    // -- election --

    /// Whether a candidate's last entry is at least as up-to-date as ours.
    fn is_log_up_to_date(&self, last_log_index: Index, last_log_term: Term) -> bool {
        let (our_index, our_term) = self.log.last_index_and_term();
        last_log_term > our_term || (last_log_term == our_term && last_log_index >= our_index)
    }

    /// Handles a RequestVote. Returns the response and whether the election
    /// timer should be reset (only when the vote was granted). The vote is
    /// durable before the response exists.
    pub fn handle_vote_request(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: Index,
        last_log_term: Term,
    ) -> Result<(RaftMessage, bool)> {
        if term > self.current_term() {
            self.become_follower(term)?;
        }
        let current = self.current_term();
        if term < current {
            debug!(node_id = self.id, candidate_id, "{}", RaftError::StaleTerm { received: term, current });
            return Ok((RaftMessage::VoteResponse { term: current, vote_granted: false }, false));
        }

        let can_vote = self.voted_for().is_none() || self.voted_for() == Some(candidate_id);
        let granted = can_vote && self.is_log_up_to_date(last_log_index, last_log_term);
        if granted {
            self.log.set_term_vote(current, Some(candidate_id))?;
        }
        debug!(node_id = self.id, term = current, candidate_id, granted, "vote request");
        Ok((RaftMessage::VoteResponse { term: current, vote_granted: granted }, granted))
    }

    /// Handles a VoteResponse. Returns true if this made us leader.
    pub fn handle_vote_response(&mut self, term: Term, vote_granted: bool, from: NodeId) -> Result<bool> {
        if term > self.current_term() {
            self.become_follower(term)?;
            return Ok(false);
        }
        if self.state != NodeState::Candidate || term < self.current_term() {
            return Ok(false);
        }
        if vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
            debug!(node_id = self.id, from, votes = self.votes_received.len(), "received vote");
        }
        if self.has_quorum() {
            self.become_leader()?;
            return Ok(true);
        }
        Ok(false)
    }

    // -- replication --

    /// Appends a client command to the leader's log. Commitment is observed
    /// asynchronously through applied entries.
    pub fn submit(&mut self, command: Vec<u8>) -> Result<LogEntry> {
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader { leader: self.leader_id });
        }
        if command.is_empty() {
            return Err(RaftError::EmptyCommand);
        }
        let result = self.check_storage().and_then(|()| self.append_command(command));
        self.note_storage(result)
    }

    fn append_command(&mut self, command: Vec<u8>) -> Result<LogEntry> {
        let entry = self.log.append_command(command)?;
        debug!(node_id = self.id, index = entry.index, term = entry.term, "appended command");
        // a single-node cluster is its own quorum
        self.maybe_commit()?;
        Ok(entry)
    }

    /// Builds the AppendEntries for a peer from its next index. Carries no
    /// entries (a heartbeat) when the peer is caught up. None unless leading.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<RaftMessage> {
        let leader = self.leader.as_ref()?;
        let next = leader.next_index.get(&peer).copied()?;
        let prev_log_index = next - 1;
        let last = (prev_log_index + self.config.max_append_entries as Index).min(self.last_log_index());
        Some(RaftMessage::AppendEntries {
            term: self.current_term(),
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index),
            entries: self.log.range(next, last),
            leader_commit: self.commit_index(),
        })
    }

    /// Starts a heartbeat round: one AppendEntries per peer. Sends nothing
    /// while storage is failed.
    pub fn heartbeat_round(&mut self) -> Vec<Envelope> {
        if self.storage_failed {
            return Vec::new();
        }
        match self.leader.as_mut() {
            Some(leader) => leader.round += 1,
            None => return Vec::new(),
        }
        self.replicate_all()
    }

    /// One AppendEntries per peer, without starting a new round.
    pub fn replicate_all(&self) -> Vec<Envelope> {
        self.peers()
            .filter_map(|peer| {
                self.create_append_entries(peer).map(|m| Envelope::new(self.id, peer, m))
            })
            .collect()
    }

    /// Handles an AppendEntries. Returns the response and whether the
    /// election timer should be reset. Appended entries are durable before
    /// the response exists.
    pub fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: NodeId,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
    ) -> Result<(RaftMessage, bool)> {
        let current = self.current_term();
        if term < current {
            debug!(node_id = self.id, leader_id, "{}", RaftError::StaleTerm { received: term, current });
            let response = RaftMessage::AppendEntriesResponse {
                term: current,
                success: false,
                match_index: self.last_log_index(),
            };
            return Ok((response, false));
        }
        if self.state == NodeState::Leader && term == current {
            warn!(node_id = self.id, leader_id, term, "another leader in our term, ignoring");
            let response = RaftMessage::AppendEntriesResponse {
                term: current,
                success: false,
                match_index: self.last_log_index(),
            };
            return Ok((response, false));
        }
        if term > current || self.state != NodeState::Follower {
            self.become_follower(term)?;
        }
        if self.leader_id != Some(leader_id) {
            info!(node_id = self.id, term, leader_id, "following leader");
            self.leader_id = Some(leader_id);
        }

        if !self.log.has_entry(prev_log_index, prev_log_term) {
            debug!(
                node_id = self.id,
                "{}",
                RaftError::LogMismatch { index: prev_log_index, term: prev_log_term }
            );
            let response = RaftMessage::AppendEntriesResponse {
                term,
                success: false,
                match_index: self.last_log_index(),
            };
            return Ok((response, true));
        }

        let last_new = self.log.splice(prev_log_index, entries)?;
        if leader_commit > self.commit_index() {
            self.log.commit(leader_commit.min(last_new))?;
        }
        let response = RaftMessage::AppendEntriesResponse { term, success: true, match_index: last_new };
        Ok((response, true))
    }

    /// Handles an AppendEntriesResponse. Returns true if the commit index
    /// advanced.
    pub fn handle_append_entries_response(
        &mut self,
        term: Term,
        success: bool,
        from: NodeId,
        match_index: Index,
    ) -> Result<bool> {
        if term > self.current_term() {
            self.become_follower(term)?;
            return Ok(false);
        }
        if term < self.current_term() {
            return Ok(false);
        }
        let Some(leader) = self.leader.as_mut() else {
            return Ok(false);
        };
        let round = leader.round;
        leader.last_ack.insert(from, round);
        let (Some(next), Some(matched)) =
            (leader.next_index.get(&from).copied(), leader.match_index.get(&from).copied())
        else {
            return Ok(false);
        };

        if success {
            let matched = matched.max(match_index);
            leader.match_index.insert(from, matched);
            leader.next_index.insert(from, next.max(matched + 1));
            self.maybe_commit()
        } else {
            // step back one entry, or straight past the end of a short log
            let next = next.saturating_sub(1).min(match_index + 1).max(matched + 1).max(1);
            leader.next_index.insert(from, next);
            debug!(node_id = self.id, peer = from, next_index = next, "backing off next index");
            Ok(false)
        }
    }

    /// Advances the commit index to the highest index stored on a quorum
    /// whose entry is from the current term. Entries from earlier terms are
    /// never committed by counting replicas, only behind a current one.
    pub fn maybe_commit(&mut self) -> Result<bool> {
        let Some(leader) = self.leader.as_ref() else {
            return Ok(false);
        };
        let term = self.current_term();
        let quorum = self.quorum_size();
        let mut candidate = None;
        for index in (self.commit_index() + 1..=self.last_log_index()).rev() {
            let entry_term = self.log.term_at(index);
            if entry_term < term {
                break;
            }
            let replicas = 1 + leader.match_index.values().filter(|&&m| m >= index).count();
            if entry_term == term && replicas >= quorum {
                candidate = Some(index);
                break;
            }
        }
        match candidate {
            Some(index) => {
                let advanced = self.log.commit(index)?;
                if advanced {
                    debug!(node_id = self.id, commit_index = index, "advanced commit index");
                }
                Ok(advanced)
            }
            None => Ok(false),
        }
    }

    /// Whether a leader has heard from a quorum within its lease. A leader
    /// cut off from the majority keeps its role until it sees a higher term,
    /// but stops claiming authority.
    pub fn is_authoritative(&self) -> bool {
        let Some(leader) = self.leader.as_ref() else {
            return false;
        };
        let lease = self.config.lease_rounds;
        let in_contact = self
            .peers()
            .filter(|peer| match leader.last_ack.get(peer) {
                Some(&acked) => leader.round - acked < lease,
                None => leader.round < lease,
            })
            .count();
        1 + in_contact >= self.quorum_size()
    }

    // -- snapshot stub --

    /// Handles an InstallSnapshot. Compaction is not implemented: the term
    /// rules apply as for AppendEntries, but the snapshot itself is ignored.
    pub fn handle_install_snapshot(&mut self, term: Term, leader_id: NodeId) -> Result<(RaftMessage, bool)> {
        let current = self.current_term();
        if term < current || (self.state == NodeState::Leader && term == current) {
            return Ok((RaftMessage::InstallSnapshotResponse { term: current }, false));
        }
        if term > current || self.state != NodeState::Follower {
            self.become_follower(term)?;
        }
        self.leader_id = Some(leader_id);
        warn!(node_id = self.id, leader_id, "snapshot installation is not supported, ignoring");
        Ok((RaftMessage::InstallSnapshotResponse { term }, true))
    }

    // -- application --

    /// Returns committed entries not yet applied and marks them applied.
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        let entries = self.log.entries_to_apply(self.last_applied);
        if let Some(last) = entries.last() {
            self.last_applied = last.index;
        }
        entries
    }

    // -- dispatch --

    /// Steps any consensus message from a peer into the node. On a storage
    /// failure nothing is returned to send, and every later step fails until
    /// storage accepts writes again.
    pub fn step(&mut self, from: NodeId, message: RaftMessage) -> Result<Output> {
        let result = self.check_storage().and_then(|()| self.step_message(from, message));
        self.note_storage(result)
    }

    fn step_message(&mut self, from: NodeId, message: RaftMessage) -> Result<Output> {
        let mut output = Output::default();

        match message {
            RaftMessage::VoteRequest { term, candidate_id, last_log_index, last_log_term } => {
                let (response, reset) =
                    self.handle_vote_request(term, candidate_id, last_log_index, last_log_term)?;
                output.messages.push(Envelope::new(self.id, from, response));
                output.reset_election_timer = reset;
            }
            RaftMessage::VoteResponse { term, vote_granted } => {
                if self.handle_vote_response(term, vote_granted, from)? {
                    output.became_leader = true;
                    output.messages = self.heartbeat_round();
                }
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let (response, reset) = self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )?;
                output.messages.push(Envelope::new(self.id, from, response));
                output.reset_election_timer = reset;
            }
            RaftMessage::AppendEntriesResponse { term, success, match_index } => {
                self.handle_append_entries_response(term, success, from, match_index)?;
                // keep a lagging follower streaming until it has caught up
                if success && self.state == NodeState::Leader {
                    if let Some(next) = self.next_index(from) {
                        if next <= self.last_log_index() {
                            if let Some(m) = self.create_append_entries(from) {
                                output.messages.push(Envelope::new(self.id, from, m));
                            }
                        }
                    }
                }
            }
            RaftMessage::InstallSnapshot { term, leader_id, .. } => {
                let (response, reset) = self.handle_install_snapshot(term, leader_id)?;
                output.messages.push(Envelope::new(self.id, from, response));
                output.reset_election_timer = reset;
            }
            RaftMessage::InstallSnapshotResponse { term } => {
                if term > self.current_term() {
                    self.become_follower(term)?;
                }
            }
            RaftMessage::GossipDigest { .. } => {
                debug!(node_id = self.id, from, "gossip digest routed to consensus, ignoring");
            }
        }
        Ok(output)
    }

    /// Runs an election after the election timer expired and returns the
    /// vote requests, or the first heartbeats if we won outright.
    pub fn election_timeout(&mut self) -> Result<Output> {
        let result = self.check_storage().and_then(|()| self.campaign());
        self.note_storage(result)
    }

    fn campaign(&mut self) -> Result<Output> {
        let mut output = Output { reset_election_timer: true, ..Default::default() };
        let request = self.start_election()?;
        if self.state == NodeState::Leader {
            output.became_leader = true;
            output.messages = self.heartbeat_round();
        } else {
            output.messages = self
                .vote_targets()
                .into_iter()
                .map(|peer| Envelope::new(self.id, peer, request.clone()))
                .collect();
        }
        Ok(output)
    }

    /// Peers this leader has not heard from in its lease window.
    pub fn unresponsive_peers(&self) -> HashSet<NodeId> {
        let Some(leader) = self.leader.as_ref() else {
            return HashSet::new();
        };
        self.peers()
            .filter(|p| match leader.last_ack.get(p) {
                Some(&acked) => leader.round - acked >= self.config.lease_rounds,
                None => leader.round >= self.config.lease_rounds,
            })
            .collect()
    }
}
