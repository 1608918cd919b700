//! # sim
//!
//! why: exercise the protocol over a network that delays, drops, partitions
//!      and crashes, instead of direct calls between nodes
//! relations: implements transport.rs; used by the cluster tests
//! what: SimNetwork (fault controls), SimTransport (per-node endpoint)

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::node::NodeId;
use crate::transport::{Inbox, Transport};

/// Delay and loss applied to every message.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Probability in [0, 1] that a message is silently dropped.
    pub loss: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { min_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), loss: 0.0 }
    }
}

#[derive(Debug, Default)]
struct NetState {
    config: SimConfig,
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    /// Directed links that drop everything.
    blocked: HashSet<(NodeId, NodeId)>,
    delivered: u64,
    dropped: u64,
}

impl NetState {
    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        self.inboxes.contains_key(&from)
            && self.inboxes.contains_key(&to)
            && !self.blocked.contains(&(from, to))
    }
}

/// An in-process network shared by all simulated nodes.
#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<NetState>>,
}

impl SimNetwork {
    pub fn new(config: SimConfig) -> Self {
        let state = NetState { config, ..Default::default() };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        // a panicking test thread is the only way to poison this
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Connects a node, replacing any previous endpoint (a restart).
    pub fn register(&self, id: NodeId) -> (SimTransport, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(id, tx);
        (SimTransport { id, network: self.clone() }, rx)
    }

    /// Disconnects a node as if its process died. In-flight messages to it
    /// are lost.
    pub fn crash(&self, id: NodeId) {
        self.lock().inboxes.remove(&id);
    }

    /// Cuts every link between the two groups, in both directions.
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut state = self.lock();
        for &a in left {
            for &b in right {
                state.blocked.insert((a, b));
                state.blocked.insert((b, a));
            }
        }
    }

    /// Cuts a node off from every other registered node.
    pub fn isolate(&self, id: NodeId) {
        let others: Vec<NodeId> = self.lock().inboxes.keys().copied().filter(|&n| n != id).collect();
        self.partition(&[id], &others);
    }

    /// Restores every link.
    pub fn heal(&self) {
        self.lock().blocked.clear();
    }

    pub fn set_loss(&self, loss: f64) {
        self.lock().config.loss = loss.clamp(0.0, 1.0);
    }

    /// (delivered, dropped) message counts.
    pub fn stats(&self) -> (u64, u64) {
        let state = self.lock();
        (state.delivered, state.dropped)
    }
}

/// One node's endpoint on a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimTransport {
    id: NodeId,
    network: SimNetwork,
}

impl Transport for SimTransport {
    fn send(
        &self,
        to: NodeId,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let from = self.id;
        let network = self.network.clone();
        let admitted = {
            let mut state = network.lock();
            if !state.reachable(from, to) {
                state.dropped += 1;
                Err(TransportError::Unreachable(to))
            } else {
                let mut rng = rand::thread_rng();
                let lost = rng.gen_bool(state.config.loss);
                let (min, max) = (state.config.min_delay, state.config.max_delay);
                let delay = if max > min { rng.gen_range(min..=max) } else { min };
                Ok((lost, delay))
            }
        };

        async move {
            let (lost, delay) = admitted?;
            tokio::time::sleep(delay).await;
            let mut state = network.lock();
            // links may have been cut while the message was in flight
            if lost || !state.reachable(from, to) {
                state.dropped += 1;
                return Ok(());
            }
            let delivered = state.inboxes.get(&to).map(|tx| tx.send(payload).is_ok()).unwrap_or(false);
            if delivered {
                state.delivered += 1;
            } else {
                state.dropped += 1;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant() -> SimConfig {
        SimConfig { min_delay: Duration::ZERO, max_delay: Duration::ZERO, loss: 0.0 }
    }

    #[tokio::test]
    async fn delivers_between_registered_nodes() {
        let net = SimNetwork::new(instant());
        let (a, _) = net.register(1);
        let (_, mut inbox_b) = net.register(2);

        a.send(2, b"hello".to_vec()).await.unwrap();
        assert_eq!(inbox_b.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(net.stats(), (1, 0));
    }

    #[tokio::test]
    async fn partition_blocks_both_directions_until_healed() {
        let net = SimNetwork::new(instant());
        let (a, mut inbox_a) = net.register(1);
        let (b, mut inbox_b) = net.register(2);

        net.partition(&[1], &[2]);
        assert_eq!(a.send(2, vec![1]).await, Err(TransportError::Unreachable(2)));
        assert_eq!(b.send(1, vec![1]).await, Err(TransportError::Unreachable(1)));

        net.heal();
        a.send(2, vec![2]).await.unwrap();
        b.send(1, vec![3]).await.unwrap();
        assert_eq!(inbox_b.recv().await.unwrap(), vec![2]);
        assert_eq!(inbox_a.recv().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn crashed_node_is_unreachable() {
        let net = SimNetwork::new(instant());
        let (a, _) = net.register(1);
        let _b = net.register(2);
        net.crash(2);
        assert!(a.send(2, vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn total_loss_drops_silently() {
        let net = SimNetwork::new(instant());
        let (a, _) = net.register(1);
        let (_, mut inbox_b) = net.register(2);
        net.set_loss(1.0);

        a.send(2, vec![1]).await.unwrap();
        assert!(inbox_b.try_recv().is_err());
        assert_eq!(net.stats(), (0, 1));
    }
}
