//! # message
//!
//! why: define all rpc message types exchanged between nodes
//! relations: produced and consumed by node.rs and gossip.rs, marshalled by rpc.rs
//! what: RaftMessage (vote, append, snapshot stub, gossip digest), Envelope

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::log::{Index, LogEntry, Term};
use crate::node::NodeId;

/// All possible messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: Index,
        last_log_term: Term,
    },
    /// Response to a vote request
    VoteResponse {
        term: Term,
        vote_granted: bool,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
    },
    /// Response to AppendEntries. On success `match_index` is the last index
    /// the request covered; on rejection it is the follower's last log index.
    AppendEntriesResponse {
        term: Term,
        success: bool,
        match_index: Index,
    },
    /// Snapshot transfer. Not acted upon yet: receivers only answer with
    /// their term, so the message is reserved for log compaction.
    InstallSnapshot {
        term: Term,
        leader_id: NodeId,
        last_included_index: Index,
        last_included_term: Term,
    },
    InstallSnapshotResponse {
        term: Term,
    },
    /// Heartbeat counters of every node the sender knows about. A digest
    /// with `reply` unset asks the receiver to answer with its own.
    GossipDigest {
        heartbeats: BTreeMap<NodeId, u64>,
        reply: bool,
    },
}

impl RaftMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest { .. } => "VoteRequest",
            RaftMessage::VoteResponse { .. } => "VoteResponse",
            RaftMessage::AppendEntries { .. } => "AppendEntries",
            RaftMessage::AppendEntriesResponse { .. } => "AppendEntriesResponse",
            RaftMessage::InstallSnapshot { .. } => "InstallSnapshot",
            RaftMessage::InstallSnapshotResponse { .. } => "InstallSnapshotResponse",
            RaftMessage::GossipDigest { .. } => "GossipDigest",
        }
    }
}

/// A message addressed from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, message: RaftMessage) -> Self {
        Self { from, to, message }
    }
}
