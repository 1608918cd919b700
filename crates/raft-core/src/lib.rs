//! # raft-core
//!
//! why: implement single-group replicated consensus (leader election plus a
//!      replicated command log) with a gossip failure detector underneath
//! relations: raft-storage provides durable storage, tests drive it over sim
//! what: log store, consensus node, gossip membership, rpc dispatch, node actor

pub mod clock;
pub mod config;
pub mod error;
pub mod gossip;
pub mod log;
pub mod message;
pub mod node;
pub mod rpc;
pub mod server;
pub mod sim;
pub mod storage;
pub mod transport;

pub use config::{GossipConfig, RaftConfig};
pub use error::{RaftError, Result, TransportError};
pub use gossip::{Gossip, GossipRecord, Liveness};
pub use log::{Index, LogEntry, RaftLog, Term};
pub use message::{Envelope, RaftMessage};
pub use node::{NodeId, NodeState, RaftNode, Status};
pub use server::{Applier, RaftHandle, RaftServer};
pub use storage::{MemoryStorage, PersistentState, Storage};
pub use transport::Transport;
