use std::time::Duration;

use openraft::SnapshotPolicy;

use super::ConsensusError;

const CLUSTER_NAME: &str = "concord";

/// Timing and compaction knobs of one consensus node.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Leader heartbeat period.
    pub heartbeat_interval: Duration,
    /// Lower bound of the randomized election timeout; the actual timeout is
    /// drawn from `[election_timeout, 2 * election_timeout)`.
    pub election_timeout: Duration,
    /// Per-RPC deadline.
    pub rpc_timeout: Duration,
    /// How long `apply` waits for commit before reporting `NoQuorum`.
    pub apply_timeout: Duration,
    /// How long membership changes wait for commit.
    pub membership_timeout: Duration,
    /// Applied entries beyond the last snapshot that trigger compaction.
    pub snapshot_threshold: u64,
    /// Upper bound on entries per AppendEntries request.
    pub max_append_entries: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout: Duration::from_millis(300),
            rpc_timeout: Duration::from_millis(200),
            apply_timeout: Duration::from_secs(5),
            membership_timeout: Duration::from_secs(10),
            snapshot_threshold: 1024,
            max_append_entries: 256,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.heartbeat_interval.as_millis() == 0 {
            return Err(ConsensusError::InvalidConfig("heartbeat_interval must be >= 1ms"));
        }
        if self.heartbeat_interval >= self.election_timeout {
            return Err(ConsensusError::InvalidConfig(
                "heartbeat_interval must be shorter than election_timeout",
            ));
        }
        if self.snapshot_threshold == 0 {
            return Err(ConsensusError::InvalidConfig("snapshot_threshold must be > 0"));
        }
        if self.max_append_entries == 0 {
            return Err(ConsensusError::InvalidConfig("max_append_entries must be > 0"));
        }
        Ok(())
    }

    /// The openraft configuration this node runs with. Compaction drops the
    /// whole log prefix behind a snapshot; lagging peers get the snapshot.
    pub(crate) fn to_openraft(&self) -> Result<openraft::Config, ConsensusError> {
        self.validate()?;
        let election = millis(self.election_timeout);
        let config = openraft::Config {
            cluster_name: CLUSTER_NAME.to_string(),
            heartbeat_interval: millis(self.heartbeat_interval),
            election_timeout_min: election,
            election_timeout_max: election * 2,
            max_payload_entries: self.max_append_entries as u64,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: 0,
            ..Default::default()
        };
        Ok(config.validate()?)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RaftConfig::default();
        config.validate().unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(150));
        assert_eq!(config.election_timeout, Duration::from_millis(300));
        assert_eq!(config.apply_timeout, Duration::from_secs(5));
    }

    #[test]
    fn heartbeat_must_be_shorter_than_election_timeout() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(300),
            ..RaftConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConsensusError::InvalidConfig(_))));
    }

    #[test]
    fn openraft_config_mirrors_the_knobs() {
        let config = RaftConfig {
            snapshot_threshold: 64,
            max_append_entries: 32,
            ..RaftConfig::default()
        }
        .to_openraft()
        .unwrap();

        assert_eq!(config.cluster_name, "concord");
        assert_eq!(config.heartbeat_interval, 150);
        assert_eq!(config.election_timeout_min, 300);
        assert_eq!(config.election_timeout_max, 600);
        assert_eq!(config.max_payload_entries, 32);
        assert_eq!(config.snapshot_policy, SnapshotPolicy::LogsSinceLast(64));
        assert_eq!(config.max_in_snapshot_log_to_keep, 0);
    }
}
