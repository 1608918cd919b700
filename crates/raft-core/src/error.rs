//! # error
//!
//! why: give every failure mode of the consensus core a typed, matchable name
//! relations: returned by node.rs, log.rs, rpc.rs and server.rs
//! what: RaftError taxonomy, TransportError, crate Result alias

use std::io;

use thiserror::Error;

use crate::log::{Index, Term};
use crate::node::NodeId;

#[derive(Error, Debug)]
pub enum RaftError {
    /// A message carried a term older than ours. The sender should adopt
    /// the term from our reply and retry as a follower.
    #[error("stale term {received}, current term is {current}")]
    StaleTerm { received: Term, current: Term },

    /// The AppendEntries consistency check failed at the given position.
    #[error("log has no entry at index {index} with term {term}")]
    LogMismatch { index: Index, term: Term },

    /// Submit on a node that is not the leader.
    #[error("not the leader, current leader is node {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    /// A durable write failed. Nothing that depended on it was acknowledged.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] io::Error),

    #[error("empty commands are reserved for leader no-ops")]
    EmptyCommand,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("node is shut down")]
    Shutdown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("send to node {0} timed out")]
    Timeout(NodeId),

    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RaftError>;

impl RaftError {
    /// Whether the node can keep serving after this error. Storage failures
    /// are not: the node must stop acknowledging until storage recovers.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, RaftError::StorageFailure(_) | RaftError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_carries_hint() {
        let err = RaftError::NotLeader { leader: Some(3) };
        assert_eq!(err.to_string(), "not the leader, current leader is node Some(3)");
    }

    #[test]
    fn storage_failure_is_fatal() {
        let err = RaftError::from(io::Error::new(io::ErrorKind::Other, "disk gone"));
        assert!(!err.is_recoverable());
        assert!(RaftError::StaleTerm { received: 1, current: 2 }.is_recoverable());
    }
}
