//! # rpc
//!
//! why: move messages between nodes over an abstract transport without ever
//!      blocking the node's event loop
//! relations: used by server.rs; marshals message.rs types, sends via transport.rs
//! what: json codec, Route classification, Dispatcher (timed fire-and-forget sends)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::message::{Envelope, RaftMessage};
use crate::node::NodeId;
use crate::transport::Transport;

/// Marshals an envelope for the wire.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Unmarshals an envelope received from the wire.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Where an inbound message is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Elections, replication and the snapshot stub: the consensus node.
    Consensus { from: NodeId, message: RaftMessage },
    /// Liveness digests: the gossip layer.
    Gossip { from: NodeId, heartbeats: BTreeMap<NodeId, u64>, reply: bool },
}

impl From<Envelope> for Route {
    fn from(envelope: Envelope) -> Self {
        match envelope.message {
            RaftMessage::GossipDigest { heartbeats, reply } => {
                Route::Gossip { from: envelope.from, heartbeats, reply }
            }
            message => Route::Consensus { from: envelope.from, message },
        }
    }
}

/// Sends and receives marshalled messages for one node.
///
/// Each outbound message gets its own task bounded by the rpc timeout, so
/// a slow or dead peer never holds up the node or the other peers. Failed
/// sends are logged and dropped; the protocol retries on its next round.
pub struct Dispatcher<T: Transport> {
    id: NodeId,
    transport: Arc<T>,
    timeout: Duration,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(id: NodeId, transport: Arc<T>, timeout: Duration) -> Self {
        Self { id, transport, timeout }
    }

    /// Sends an envelope without waiting for it to be delivered.
    pub fn send(&self, envelope: Envelope) {
        let to = envelope.to;
        let kind = envelope.message.kind();
        let payload = match encode(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(node_id = self.id, to, kind, error = %e, "failed to encode message");
                return;
            }
        };
        let transport = Arc::clone(&self.transport);
        let timeout = self.timeout;
        let id = self.id;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.send(to, payload)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(to)),
            };
            if let Err(e) = result {
                debug!(node_id = id, to, kind, error = %e, "send failed");
            }
        });
    }

    pub fn send_all(&self, envelopes: impl IntoIterator<Item = Envelope>) {
        for envelope in envelopes {
            self.send(envelope);
        }
    }

    /// Decodes inbound bytes and classifies them. Malformed or misaddressed
    /// messages are logged and dropped.
    pub fn receive(&self, bytes: &[u8]) -> Option<Route> {
        let envelope = match decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(node_id = self.id, error = %e, "dropping undecodable message");
                return None;
            }
        };
        if envelope.to != self.id {
            warn!(node_id = self.id, to = envelope.to, "dropping misaddressed message");
            return None;
        }
        debug!(node_id = self.id, from = envelope.from, kind = envelope.message.kind(), "received");
        Some(envelope.into())
    }
}
