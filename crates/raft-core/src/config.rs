//! # config
//!
//! why: keep every timing and batching knob of a node in one validated place
//! relations: read by clock.rs, node.rs, gossip.rs and server.rs
//! what: RaftConfig, GossipConfig, json loading and validation

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Timing and replication settings for a raft node.
///
/// All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout (inclusive)
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats. Must be below `election_timeout_min`.
    pub heartbeat_interval: u64,
    /// Deadline for a single outbound rpc
    pub rpc_timeout: u64,
    /// Maximum number of entries carried by one AppendEntries
    pub max_append_entries: usize,
    /// Heartbeat rounds a leader tolerates without hearing from a quorum
    /// before it reports itself as non-authoritative.
    pub lease_rounds: u64,
    pub gossip: GossipConfig,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_append_entries: 64,
            lease_rounds: 3,
            gossip: GossipConfig::default(),
        }
    }
}

/// Settings for the gossip failure detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Interval between gossip rounds
    pub interval: u64,
    /// Number of peers contacted per round
    pub fanout: usize,
    /// Rounds without a counter increase before a peer is suspected
    pub suspicion_rounds: u32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self { interval: 100, fanout: 2, suspicion_rounds: 5 }
    }
}

impl GossipConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub fn suspicion_timeout(&self) -> Duration {
        self.interval() * self.suspicion_rounds
    }
}

impl RaftConfig {
    /// Parses a json document, filling absent fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RaftConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min == 0 || self.heartbeat_interval == 0 {
            return Err(RaftError::InvalidConfig("timeouts must be positive".into()));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_min {} exceeds election_timeout_max {}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        // a live leader must never be unseated by a follower's timeout
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval {} must be below election_timeout_min {}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.rpc_timeout == 0 || self.max_append_entries == 0 || self.lease_rounds == 0 {
            return Err(RaftError::InvalidConfig(
                "rpc_timeout, max_append_entries and lease_rounds must be positive".into(),
            ));
        }
        if self.gossip.interval == 0 || self.gossip.fanout == 0 || self.gossip.suspicion_rounds == 0
        {
            return Err(RaftError::InvalidConfig("gossip settings must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_must_undercut_election_timeout() {
        let config = RaftConfig { heartbeat_interval: 150, ..Default::default() };
        assert!(matches!(config.validate(), Err(RaftError::InvalidConfig(_))));
    }

    #[test]
    fn inverted_timeout_range_is_rejected() {
        let config = RaftConfig {
            election_timeout_min: 400,
            election_timeout_max: 200,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_fills_missing_fields() {
        let config =
            RaftConfig::from_json(r#"{"heartbeat_interval": 20, "gossip": {"fanout": 3}}"#)
                .unwrap();
        assert_eq!(config.heartbeat_interval, 20);
        assert_eq!(config.election_timeout_min, 150);
        assert_eq!(config.gossip.fanout, 3);
        assert_eq!(config.gossip.interval, 100);
    }

    #[test]
    fn suspicion_timeout_is_multiple_of_interval() {
        let gossip = GossipConfig { interval: 40, fanout: 1, suspicion_rounds: 4 };
        assert_eq!(gossip.suspicion_timeout(), Duration::from_millis(160));
    }
}
