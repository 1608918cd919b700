//! # server
//!
//! why: run a node as a single sequential actor so that timers, inbound rpcs
//!      and client requests never interleave inside the state machine
//! relations: owns node.rs and gossip.rs, sends through rpc.rs, times with clock.rs
//! what: RaftServer event loop, RaftHandle (submit, status, committed stream), Applier

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::clock::{self, ElectionTimer, Periodic};
use crate::error::{RaftError, Result};
use crate::gossip::Gossip;
use crate::log::{Index, LogEntry, Term};
use crate::node::{NodeId, NodeState, Output, RaftNode, Status};
use crate::rpc::{Dispatcher, Route};
use crate::transport::{Inbox, Transport};

/// Capacity of the committed-entries broadcast; slow subscribers lag.
const COMMITTED_CAPACITY: usize = 1024;

/// Receives committed entries in increasing index order, at least once:
/// after a restart, entries are delivered again from the start of the log,
/// so implementations must be idempotent on the entry index.
pub trait Applier: Send + 'static {
    fn on_committed(&mut self, entry: &LogEntry);
}

impl<F> Applier for F
where
    F: FnMut(&LogEntry) + Send + 'static,
{
    fn on_committed(&mut self, entry: &LogEntry) {
        self(entry)
    }
}

/// Requests from handles into the event loop
#[derive(Debug)]
enum Request {
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<(Index, Term)>>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
}

/// A cloneable handle to a running node.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    id: NodeId,
    requests: mpsc::Sender<Request>,
    committed: broadcast::Sender<LogEntry>,
    shutdown: CancellationToken,
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Appends a command on the leader. Returns where it was placed; it is
    /// committed once it shows up on the committed stream.
    pub async fn submit(&self, command: Vec<u8>) -> Result<(Index, Term)> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Submit { command, reply })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn status(&self) -> Result<Status> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(Request::Status { reply }).await.map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Subscribes to entries committed from now on (leader no-ops excluded).
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.committed.subscribe()
    }

    /// Stops the event loop. Pending requests fail with `Shutdown`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// The event loop owning one node and its gossip state.
pub struct RaftServer<T: Transport> {
    node: RaftNode,
    gossip: Gossip,
    dispatcher: Dispatcher<T>,
    inbox: Inbox,
    requests: mpsc::Receiver<Request>,
    applier: Option<Box<dyn Applier>>,
    committed: broadcast::Sender<LogEntry>,
    shutdown: CancellationToken,
    election: ElectionTimer,
    heartbeat: Periodic,
    gossip_timer: Periodic,
    /// Whether the last heartbeat round found the leader out of contact.
    lost_quorum: bool,
}

impl<T: Transport> RaftServer<T> {
    /// Spawns the event loop for a node on the current runtime.
    pub fn spawn(
        node: RaftNode,
        transport: T,
        inbox: Inbox,
        applier: Option<Box<dyn Applier>>,
    ) -> (RaftHandle, JoinHandle<()>) {
        let id = node.id;
        let config = node.config.clone();
        let (request_tx, request_rx) = mpsc::channel(128);
        let (committed, _) = broadcast::channel(COMMITTED_CAPACITY);
        let shutdown = CancellationToken::new();

        let server = Self {
            gossip: Gossip::new(id, node.cluster_nodes.clone(), config.gossip.clone(), Instant::now()),
            dispatcher: Dispatcher::new(id, Arc::new(transport), config.rpc_timeout()),
            inbox,
            requests: request_rx,
            applier,
            committed: committed.clone(),
            shutdown: shutdown.clone(),
            election: ElectionTimer::new(config.election_timeout_min, config.election_timeout_max),
            heartbeat: Periodic::stopped(config.heartbeat_interval()),
            gossip_timer: Periodic::new(config.gossip.interval()),
            lost_quorum: false,
            node,
        };
        let handle = RaftHandle { id, requests: request_tx, committed, shutdown };
        let task = tokio::spawn(server.run().instrument(tracing::info_span!("raft", node_id = id)));
        (handle, task)
    }

    async fn run(mut self) {
        info!("node running");
        // entries committed before a restart are delivered again
        self.apply_committed();
        loop {
            let election_deadline = match self.node.state() {
                NodeState::Leader => None,
                _ => self.election.deadline(),
            };
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(bytes) = self.inbox.recv() => self.on_inbound(&bytes),
                Some(request) = self.requests.recv() => self.on_request(request),
                _ = clock::sleep_until(election_deadline) => self.on_election_timeout(),
                _ = clock::sleep_until(self.heartbeat.deadline()) => self.on_heartbeat(),
                _ = clock::sleep_until(self.gossip_timer.deadline()) => self.on_gossip_tick(),
            }
            self.apply_committed();
        }
        info!(term = self.node.current_term(), "node stopped");
    }

    fn on_inbound(&mut self, bytes: &[u8]) {
        match self.dispatcher.receive(bytes) {
            Some(Route::Gossip { from, heartbeats, reply }) => {
                if let Some(answer) = self.gossip.handle_digest(from, &heartbeats, reply, Instant::now()) {
                    self.dispatcher.send(answer);
                }
                self.node.set_liveness(self.gossip.liveness_view());
            }
            Some(Route::Consensus { from, message }) => {
                let before = self.node.state();
                let result = self.node.step(from, message);
                self.handle_output(before, result);
            }
            None => {}
        }
    }

    fn on_request(&mut self, request: Request) {
        match request {
            Request::Submit { command, reply } => {
                let before = self.node.state();
                let result = self.node.submit(command);
                if let Err(RaftError::StorageFailure(e)) = &result {
                    error!(error = %e, "failed to persist submitted command");
                    self.follow_role(before, false);
                }
                let placed = result.map(|entry| (entry.index, entry.term));
                if placed.is_ok() {
                    // replicate now rather than waiting for the next heartbeat
                    self.dispatcher.send_all(self.node.replicate_all());
                }
                let _ = reply.send(placed);
            }
            Request::Status { reply } => {
                let _ = reply.send(self.node.status());
            }
        }
    }

    fn on_election_timeout(&mut self) {
        let before = self.node.state();
        debug!(term = self.node.current_term(), from = %before, "election timeout");
        let result = self.node.election_timeout();
        self.election.reset();
        self.handle_output(before, result);
    }

    fn on_heartbeat(&mut self) {
        self.heartbeat.advance();
        let messages = self.node.heartbeat_round();
        self.dispatcher.send_all(messages);

        let authoritative = self.node.is_authoritative();
        if !authoritative && !self.lost_quorum {
            warn!(
                term = self.node.current_term(),
                unresponsive = ?self.node.unresponsive_peers(),
                "leader lost contact with quorum"
            );
        } else if authoritative && self.lost_quorum {
            info!(term = self.node.current_term(), "leader regained quorum contact");
        }
        self.lost_quorum = !authoritative;
    }

    fn on_gossip_tick(&mut self) {
        self.gossip_timer.advance();
        let digests = self.gossip.tick(Instant::now());
        self.dispatcher.send_all(digests);
        self.node.set_liveness(self.gossip.liveness_view());
    }

    /// Applies the node's reaction to an event: sends its messages and
    /// keeps the timers in step with its role.
    fn handle_output(&mut self, before: NodeState, result: Result<Output>) {
        let output = match result {
            Ok(output) => output,
            Err(e) if !e.is_recoverable() => {
                error!(error = %e, "withholding acknowledgements until storage recovers");
                self.follow_role(before, false);
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to process event");
                return;
            }
        };
        if output.reset_election_timer {
            self.election.reset();
        }
        self.follow_role(before, output.became_leader);
        self.dispatcher.send_all(output.messages);
    }

    /// Starts the heartbeat on taking office; stops it and re-arms the
    /// election timer on leaving.
    fn follow_role(&mut self, before: NodeState, became_leader: bool) {
        let after = self.node.state();
        if after == NodeState::Leader && (before != NodeState::Leader || became_leader) {
            // the first round went out with the output; keep the cadence from here
            self.heartbeat = Periodic::new(self.node.config.heartbeat_interval());
            self.lost_quorum = false;
        } else if after != NodeState::Leader && before == NodeState::Leader {
            self.heartbeat.cancel();
            self.election.reset();
        }
    }

    /// Hands newly committed entries to the applier and subscribers.
    fn apply_committed(&mut self) {
        for entry in self.node.get_entries_to_apply() {
            if entry.is_noop() {
                continue;
            }
            if let Some(applier) = self.applier.as_mut() {
                applier.on_committed(&entry);
            }
            // no subscribers is fine
            let _ = self.committed.send(entry);
        }
    }
}
