//! # transport
//!
//! why: abstract how marshalled messages reach a named peer
//! relations: used by rpc.rs for outbound sends; sim.rs provides an in-process network
//! what: Transport trait, Inbox type

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::node::NodeId;

/// Bytes delivered to a node, in arrival order.
pub type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

/// Fire-and-forget delivery of marshalled messages to peers.
///
/// Callers bound every send with their own timeout; a send that fails or
/// times out is simply retried by the protocol on its next round. Inbound
/// bytes arrive on the [`Inbox`] handed out alongside the transport.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        to: NodeId,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}
