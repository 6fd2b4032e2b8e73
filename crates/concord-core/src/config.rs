//! Configuration - TOML ファイル + 環境変数
//!
//! すべてのフィールドにデフォルトがあり、空ファイルでも起動できます。
//! 時間は `*_ms` の整数で書きます。
//!
//! # 環境変数（ファイルより優先）
//! - `CONCORD_NODE_ID`
//! - `CONCORD_BIND_ADDR`
//! - `CONCORD_DATA_DIR`
//! - `CONCORD_PEERS`: `id=host:port` のカンマ区切り（static discovery になる）

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consensus::RaftConfig;
use crate::discovery::NodeAddress;
use crate::domain::{DEFAULT_MAX_CONCURRENT_TASKS, DEFAULT_MAX_RETRIES};
use crate::queue::QueueConfig;
use crate::session::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid peer entry '{0}', expected id=host:port")]
    InvalidPeer(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcordConfig {
    pub node: NodeSection,
    pub raft: RaftSection,
    pub discovery: DiscoverySection,
    pub lock: LockSection,
    pub queue: QueueSection,
    pub session: SessionSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSection {
    pub id: String,
    pub bind_addr: String,
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: "node-1".into(),
            bind_addr: "127.0.0.1:7400".into(),
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RaftSection {
    pub heartbeat_ms: u64,
    pub election_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub apply_timeout_ms: u64,
    pub membership_timeout_ms: u64,
    pub snapshot_threshold: u64,
    pub max_append_entries: usize,
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            heartbeat_ms: 150,
            election_timeout_ms: 300,
            rpc_timeout_ms: 200,
            apply_timeout_ms: 5_000,
            membership_timeout_ms: 10_000,
            snapshot_threshold: 1024,
            max_append_entries: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoverySection {
    Static {
        #[serde(default)]
        peers: Vec<NodeAddress>,
    },
    Dns {
        name: String,
        port: u16,
        #[serde(default = "default_dns_poll_ms")]
        poll_interval_ms: u64,
    },
}

impl Default for DiscoverySection {
    fn default() -> Self {
        DiscoverySection::Static { peers: Vec::new() }
    }
}

fn default_dns_poll_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockSection {
    pub cleanup_interval_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSection {
    pub claim_timeout_ms: u64,
    pub max_retries: u32,
    pub claim_batch_size: usize,
    pub sweep_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            claim_timeout_ms: 10 * 60 * 1000,
            max_retries: DEFAULT_MAX_RETRIES,
            claim_batch_size: 10,
            sweep_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub lease_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub default_max_concurrent_tasks: u32,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            lease_timeout_ms: 30_000,
            health_check_interval_ms: 10_000,
            default_max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

impl ConcordConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `CONCORD_*` overrides from the process environment.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `CONCORD_*` overrides read through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(id) = lookup("CONCORD_NODE_ID") {
            self.node.id = id;
        }
        if let Some(addr) = lookup("CONCORD_BIND_ADDR") {
            self.node.bind_addr = addr;
        }
        if let Some(dir) = lookup("CONCORD_DATA_DIR") {
            self.node.data_dir = PathBuf::from(dir);
        }
        if let Some(peers) = lookup("CONCORD_PEERS") {
            self.discovery = DiscoverySection::Static {
                peers: parse_peers(&peers)?,
            };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::InvalidValue { field, reason });
        if self.node.id.trim().is_empty() {
            return invalid("node.id", "must not be empty");
        }
        if self.raft.heartbeat_ms == 0 {
            return invalid("raft.heartbeat_ms", "must be > 0");
        }
        if self.raft.heartbeat_ms >= self.raft.election_timeout_ms {
            return invalid("raft.heartbeat_ms", "must be shorter than election_timeout_ms");
        }
        if self.queue.claim_timeout_ms == 0 {
            return invalid("queue.claim_timeout_ms", "must be > 0");
        }
        if self.queue.claim_batch_size == 0 {
            return invalid("queue.claim_batch_size", "must be > 0");
        }
        if self.session.lease_timeout_ms == 0 {
            return invalid("session.lease_timeout_ms", "must be > 0");
        }
        if self.session.default_max_concurrent_tasks == 0 {
            return invalid("session.default_max_concurrent_tasks", "must be > 0");
        }
        let intervals = [
            ("lock.cleanup_interval_ms", self.lock.cleanup_interval_ms),
            ("queue.sweep_interval_ms", self.queue.sweep_interval_ms),
            ("session.health_check_interval_ms", self.session.health_check_interval_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return invalid(field, "must be > 0");
            }
        }
        Ok(())
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            heartbeat_interval: ms(self.raft.heartbeat_ms),
            election_timeout: ms(self.raft.election_timeout_ms),
            rpc_timeout: ms(self.raft.rpc_timeout_ms),
            apply_timeout: ms(self.raft.apply_timeout_ms),
            membership_timeout: ms(self.raft.membership_timeout_ms),
            snapshot_threshold: self.raft.snapshot_threshold,
            max_append_entries: self.raft.max_append_entries,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            claim_timeout: ms(self.queue.claim_timeout_ms),
            max_retries: self.queue.max_retries,
            claim_batch_size: self.queue.claim_batch_size,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            lease_timeout: ms(self.session.lease_timeout_ms),
            health_check_interval: ms(self.session.health_check_interval_ms),
            default_max_concurrent_tasks: self.session.default_max_concurrent_tasks,
        }
    }

    pub fn claim_sweep_interval(&self) -> Duration {
        ms(self.queue.sweep_interval_ms)
    }

    pub fn lock_cleanup_interval(&self) -> Duration {
        ms(self.lock.cleanup_interval_ms)
    }
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn parse_peers(list: &str) -> Result<Vec<NodeAddress>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((id, addr)) if !id.trim().is_empty() && !addr.trim().is_empty() => {
                Ok(NodeAddress::new(id.trim(), addr.trim()))
            }
            _ => Err(ConfigError::InvalidPeer(entry.to_string())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ConcordConfig::from_toml_str("").unwrap();
        assert_eq!(config, ConcordConfig::default());
        assert_eq!(config.raft_config().heartbeat_interval, Duration::from_millis(150));
        assert_eq!(config.queue_config().claim_timeout, Duration::from_secs(600));
        assert_eq!(config.queue_config().max_retries, 3);
        assert_eq!(config.session_config().lease_timeout, Duration::from_secs(30));
        assert_eq!(config.lock_cleanup_interval(), Duration::from_secs(60));
        config.raft_config().validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let config = ConcordConfig::from_toml_str(
            r#"
            [node]
            id = "n2"
            bind_addr = "0.0.0.0:9000"

            [raft]
            heartbeat_ms = 50
            election_timeout_ms = 250

            [discovery]
            kind = "dns"
            name = "concord.internal"
            port = 9000

            [queue]
            claim_timeout_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.node.id, "n2");
        assert_eq!(config.node.data_dir, PathBuf::from("data"));
        assert_eq!(config.raft_config().election_timeout, Duration::from_millis(250));
        assert_eq!(config.queue_config().claim_timeout, Duration::from_millis(100));
        assert_eq!(
            config.discovery,
            DiscoverySection::Dns {
                name: "concord.internal".into(),
                port: 9000,
                poll_interval_ms: 10_000,
            }
        );
    }

    #[test]
    fn static_peers_parse_from_toml() {
        let config = ConcordConfig::from_toml_str(
            r#"
            [discovery]
            kind = "static"
            peers = [
                { id = "n1", addr = "10.0.0.1:7400" },
                { id = "n2", addr = "10.0.0.2:7400" },
            ]
            "#,
        )
        .unwrap();
        let DiscoverySection::Static { peers } = config.discovery else {
            panic!("expected static discovery");
        };
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1], NodeAddress::new("n2", "10.0.0.2:7400"));
    }

    #[test]
    fn environment_wins_over_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CONCORD_NODE_ID", "n7"),
            ("CONCORD_DATA_DIR", "/var/lib/concord"),
            ("CONCORD_PEERS", "n1=a:1, n7=b:2"),
        ]);
        let config = ConcordConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.node.id, "n7");
        assert_eq!(config.node.bind_addr, "127.0.0.1:7400");
        assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/concord"));
        assert_eq!(
            config.discovery,
            DiscoverySection::Static {
                peers: vec![NodeAddress::new("n1", "a:1"), NodeAddress::new("n7", "b:2")],
            }
        );
    }

    #[test]
    fn malformed_peer_is_rejected() {
        let err = ConcordConfig::default()
            .with_overrides(|key| (key == "CONCORD_PEERS").then(|| "n1".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPeer(p) if p == "n1"));
    }

    #[rstest]
    #[case("[raft]\nheartbeat_ms = 0", "raft.heartbeat_ms")]
    #[case("[raft]\nheartbeat_ms = 400", "raft.heartbeat_ms")]
    #[case("[queue]\nclaim_batch_size = 0", "queue.claim_batch_size")]
    #[case("[lock]\ncleanup_interval_ms = 0", "lock.cleanup_interval_ms")]
    #[case("[node]\nid = \"\"", "node.id")]
    fn invalid_values_are_rejected(#[case] text: &str, #[case] expected: &str) {
        let err = ConcordConfig::from_toml_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == expected));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            ConcordConfig::from_toml_str("[raft]\nheartbeat = 10"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concord.toml");
        std::fs::write(&path, "[node]\nid = \"disk\"\n").unwrap();
        assert_eq!(ConcordConfig::load(&path).unwrap().node.id, "disk");
        assert!(matches!(
            ConcordConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
