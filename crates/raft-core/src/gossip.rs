//! # gossip
//!
//! why: estimate peer liveness without any coordination, independent of
//!      terms and the log, by epidemic exchange of heartbeat counters
//! relations: driven by server.rs on its own interval; feeds node.rs liveness hints
//! what: GossipRecord, Liveness, Gossip (rounds, digest merge, suspicion)

use std::collections::{BTreeMap, HashMap};

use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::GossipConfig;
use crate::message::{Envelope, RaftMessage};
use crate::node::NodeId;

/// What the local gossip view believes about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The peer's counter increased within the suspicion timeout.
    Alive,
    /// The peer's counter has not increased for the suspicion timeout.
    Suspected,
    /// The peer is neither configured nor heard of.
    Unknown,
}

/// The local view of one node's heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipRecord {
    pub node_id: NodeId,
    pub heartbeat_counter: u64,
    /// When the counter last increased.
    pub last_updated: Instant,
    pub suspected: bool,
}

/// Gossip membership state for one node.
///
/// Each round the node bumps its own counter and pushes its digest to a few
/// random peers, which merge it (highest counter wins) and push theirs back.
/// A peer whose counter stalls for the suspicion timeout becomes suspected.
/// Suspicion is advisory: it never changes the consensus quorum.
#[derive(Debug)]
pub struct Gossip {
    id: NodeId,
    config: GossipConfig,
    records: BTreeMap<NodeId, GossipRecord>,
}

impl Gossip {
    /// Creates the view with a record for ourselves and every configured
    /// member. Members start with a zero counter as of `now`, so one that
    /// never speaks is suspected once the suspicion timeout has passed.
    pub fn new(id: NodeId, members: Vec<NodeId>, config: GossipConfig, now: Instant) -> Self {
        let records = members
            .into_iter()
            .chain(std::iter::once(id))
            .map(|node_id| {
                let record =
                    GossipRecord { node_id, heartbeat_counter: 0, last_updated: now, suspected: false };
                (node_id, record)
            })
            .collect();
        Self { id, config, records }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn record(&self, node_id: NodeId) -> Option<&GossipRecord> {
        self.records.get(&node_id)
    }

    /// Heartbeat counters of every known node, including our own.
    pub fn digest(&self) -> BTreeMap<NodeId, u64> {
        self.records.iter().map(|(id, r)| (*id, r.heartbeat_counter)).collect()
    }

    /// Runs one gossip round: bumps our counter, refreshes suspicion and
    /// returns digests for up to `fanout` random peers.
    pub fn tick(&mut self, now: Instant) -> Vec<Envelope> {
        if let Some(own) = self.records.get_mut(&self.id) {
            own.heartbeat_counter += 1;
            own.last_updated = now;
        }
        self.refresh(now);

        let candidates: Vec<NodeId> = self.records.keys().copied().filter(|&id| id != self.id).collect();

        let digest = self.digest();
        candidates
            .choose_multiple(&mut rand::thread_rng(), self.config.fanout)
            .map(|&peer| {
                Envelope::new(
                    self.id,
                    peer,
                    RaftMessage::GossipDigest { heartbeats: digest.clone(), reply: false },
                )
            })
            .collect()
    }

    /// Merges a received digest. For every node the higher counter wins; a
    /// record is created the first time a node is heard of. Returns the
    /// number of records that changed.
    pub fn merge(&mut self, heartbeats: &BTreeMap<NodeId, u64>, now: Instant) -> usize {
        let mut changed = 0;
        for (&node_id, &counter) in heartbeats {
            match self.records.get_mut(&node_id) {
                // others remember a higher counter for us from before a restart
                Some(own) if node_id == self.id => {
                    if counter > own.heartbeat_counter {
                        own.heartbeat_counter = counter;
                    }
                }
                Some(record) => {
                    if counter > record.heartbeat_counter {
                        record.heartbeat_counter = counter;
                        record.last_updated = now;
                        if record.suspected {
                            info!(node_id = self.id, peer = node_id, "peer no longer suspected");
                            record.suspected = false;
                        }
                        changed += 1;
                    }
                }
                None => {
                    debug!(node_id = self.id, peer = node_id, "first contact");
                    self.records.insert(
                        node_id,
                        GossipRecord {
                            node_id,
                            heartbeat_counter: counter,
                            last_updated: now,
                            suspected: false,
                        },
                    );
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Merges an inbound digest and answers it with ours unless it was
    /// itself an answer.
    pub fn handle_digest(
        &mut self,
        from: NodeId,
        heartbeats: &BTreeMap<NodeId, u64>,
        reply: bool,
        now: Instant,
    ) -> Option<Envelope> {
        self.merge(heartbeats, now);
        if reply {
            return None;
        }
        Some(Envelope::new(
            self.id,
            from,
            RaftMessage::GossipDigest { heartbeats: self.digest(), reply: true },
        ))
    }

    /// Re-evaluates suspicion of every peer record.
    pub fn refresh(&mut self, now: Instant) {
        let timeout = self.config.suspicion_timeout();
        for record in self.records.values_mut().filter(|r| r.node_id != self.id) {
            let stale = now.saturating_duration_since(record.last_updated) >= timeout;
            if stale != record.suspected {
                if stale {
                    info!(node_id = self.id, peer = record.node_id, "suspecting peer");
                } else {
                    info!(node_id = self.id, peer = record.node_id, "peer no longer suspected");
                }
                record.suspected = stale;
            }
        }
    }

    pub fn liveness(&self, peer: NodeId) -> Liveness {
        match self.records.get(&peer) {
            None => Liveness::Unknown,
            Some(r) if r.suspected => Liveness::Suspected,
            Some(_) => Liveness::Alive,
        }
    }

    /// Liveness of every configured or known peer.
    pub fn liveness_view(&self) -> HashMap<NodeId, Liveness> {
        self.records.keys().filter(|&&id| id != self.id).map(|&id| (id, self.liveness(id))).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> GossipConfig {
        GossipConfig { interval: 100, fanout: 2, suspicion_rounds: 3 }
    }

    #[test]
    fn tick_bumps_own_counter_and_targets_fanout() {
        let now = Instant::now();
        let mut gossip = Gossip::new(1, vec![1, 2, 3, 4], config(), now);
        let messages = gossip.tick(now);

        assert_eq!(gossip.record(1).unwrap().heartbeat_counter, 1);
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.to != 1 && m.from == 1));
    }

    #[test]
    fn higher_counter_wins_on_merge() {
        let now = Instant::now();
        let mut gossip = Gossip::new(1, vec![1, 2], config(), now);
        gossip.merge(&BTreeMap::from([(2, 5)]), now);
        gossip.merge(&BTreeMap::from([(2, 3)]), now);
        assert_eq!(gossip.record(2).unwrap().heartbeat_counter, 5);
    }

    #[test]
    fn third_party_nodes_are_learned() {
        let now = Instant::now();
        let mut gossip = Gossip::new(1, vec![1, 2], config(), now);
        assert_eq!(gossip.liveness(3), Liveness::Unknown);
        gossip.merge(&BTreeMap::from([(2, 1), (3, 7)]), now);
        assert_eq!(gossip.liveness(3), Liveness::Alive);
    }

    #[test]
    fn stalled_counter_becomes_suspected_and_recovers() {
        let start = Instant::now();
        let mut gossip = Gossip::new(1, vec![1, 2], config(), start);
        gossip.merge(&BTreeMap::from([(2, 1)]), start);

        gossip.refresh(start + Duration::from_millis(299));
        assert_eq!(gossip.liveness(2), Liveness::Alive);

        let later = start + Duration::from_millis(300);
        gossip.refresh(later);
        assert_eq!(gossip.liveness(2), Liveness::Suspected);

        // a repeated counter is not a sign of life
        gossip.merge(&BTreeMap::from([(2, 1)]), later);
        assert_eq!(gossip.liveness(2), Liveness::Suspected);

        gossip.merge(&BTreeMap::from([(2, 2)]), later);
        assert_eq!(gossip.liveness(2), Liveness::Alive);
    }

    #[test]
    fn digest_is_answered_once() {
        let now = Instant::now();
        let mut gossip = Gossip::new(1, vec![1, 2], config(), now);
        let answer = gossip.handle_digest(2, &BTreeMap::from([(2, 1)]), false, now).unwrap();
        assert_eq!(answer.to, 2);
        assert!(matches!(answer.message, RaftMessage::GossipDigest { reply: true, .. }));
        assert!(gossip.handle_digest(2, &BTreeMap::from([(2, 2)]), true, now).is_none());
    }

    #[test]
    fn member_silent_from_boot_is_suspected() {
        let start = Instant::now();
        let mut gossip = Gossip::new(1, vec![1, 2, 3], config(), start);
        assert_eq!(gossip.liveness(3), Liveness::Alive);
        gossip.merge(&BTreeMap::from([(2, 1)]), start + Duration::from_millis(250));

        gossip.refresh(start + Duration::from_millis(300));
        assert_eq!(gossip.liveness(3), Liveness::Suspected);
        assert_eq!(gossip.liveness(2), Liveness::Alive);
        assert_eq!(gossip.liveness_view().len(), 2);
    }

    #[test]
    fn own_counter_catches_up_after_restart() {
        let now = Instant::now();
        let mut gossip = Gossip::new(1, vec![1, 2], config(), now);
        gossip.merge(&BTreeMap::from([(1, 40)]), now);
        gossip.tick(now);
        assert_eq!(gossip.record(1).unwrap().heartbeat_counter, 41);
    }
}
