//! Configuration for rdbcoord

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Strategy name accepted in `coordination_strategy_class`
pub const RDBMS_STRATEGY: &str = "rdbms";

/// Recommended lower bound for the heartbeat interval
pub const RECOMMENDED_HEARTBEAT_INTERVAL_MS: u64 = 5000;

/// Recommended lower bound for consecutive retries
pub const RECOMMENDED_HEARTBEAT_MAX_RETRY: u32 = 3;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file (optional) and `RDBCOORD__*`
    /// environment overrides, e.g. `RDBCOORD__CLUSTER__ENABLED=true`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let built = builder
            .add_source(
                config::Environment::with_prefix("RDBCOORD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(built.try_deserialize()?)
    }
}

/// Cluster coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Whether coordination is enabled at all
    #[serde(default)]
    pub enabled: bool,

    /// Selects the coordination strategy implementation
    #[serde(default = "default_strategy_class")]
    pub coordination_strategy_class: String,

    /// Coordination group (key of the leadership row)
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Pinned node id; a random one is generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    #[serde(default)]
    pub strategy_config: StrategyConfig,

    #[serde(default)]
    pub database: DatabaseConfig,
}

fn default_strategy_class() -> String {
    RDBMS_STRATEGY.to_string()
}
fn default_group_id() -> String {
    "default".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            coordination_strategy_class: default_strategy_class(),
            group_id: default_group_id(),
            node_id: None,
            strategy_config: StrategyConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// Tuning values for heartbeats and leases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Period of both the heartbeat and the election cycle
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Store retries per cycle, and missed intervals before a peer is dead
    #[serde(default = "default_heartbeat_max_retry")]
    pub heartbeat_max_retry: u32,

    /// Leadership lease; defaults to `interval * (max_retry + 2)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_ms: Option<u64>,

    /// Bound on a single store call
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Initial backoff between store retries
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub miss_policy: MissPolicy,
}

fn default_heartbeat_interval() -> u64 {
    RECOMMENDED_HEARTBEAT_INTERVAL_MS
}
fn default_heartbeat_max_retry() -> u32 {
    RECOMMENDED_HEARTBEAT_MAX_RETRY
}
fn default_store_timeout() -> u64 {
    2000
}
fn default_retry_backoff() -> u64 {
    100
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_max_retry: default_heartbeat_max_retry(),
            lease_duration_ms: None,
            store_timeout_ms: default_store_timeout(),
            retry_backoff_ms: default_retry_backoff(),
            miss_policy: MissPolicy::default(),
        }
    }
}

/// How a newer heartbeat affects a peer that has been missing intervals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissPolicy {
    /// Any newer timestamp returns the peer to alive
    #[default]
    ResetOnSuccess,
    /// A newer timestamp that is already older than one interval (by the
    /// store's clock) does not reset the miss counter
    RequireFreshRead,
}

impl StrategyConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms.unwrap_or_else(|| {
            self.heartbeat_interval_ms
                .saturating_mul(u64::from(self.heartbeat_max_retry).saturating_add(2))
        }))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Time a leader keeps in reserve before its lease expires
    pub fn lease_safety_margin(&self) -> Duration {
        self.store_timeout().min(self.lease_duration() / 4)
    }

    /// Silence after which a peer is declared dead
    pub fn failure_timeout(&self) -> Duration {
        self.heartbeat_interval()
            .checked_mul(self.heartbeat_max_retry)
            .unwrap_or(Duration::MAX)
    }

    /// Reject values the engines cannot run with; warn about values below
    /// the recommended floor.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.heartbeat_max_retry == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_max_retry must be at least 1".into(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "store_timeout_ms must be positive".into(),
            ));
        }
        let overflow = |what: &str| {
            Error::InvalidConfig(format!("{} overflows with the configured values", what))
        };
        let lease_ms = match self.lease_duration_ms {
            Some(ms) => ms,
            None => u64::from(self.heartbeat_max_retry)
                .checked_add(2)
                .and_then(|n| self.heartbeat_interval_ms.checked_mul(n))
                .ok_or_else(|| overflow("default lease_duration"))?,
        };
        self.heartbeat_interval()
            .checked_mul(self.heartbeat_max_retry)
            .ok_or_else(|| overflow("heartbeat_interval * heartbeat_max_retry"))?;
        let floor = self
            .heartbeat_max_retry
            .checked_add(1)
            .and_then(|n| self.heartbeat_interval().checked_mul(n))
            .ok_or_else(|| overflow("heartbeat_interval * (heartbeat_max_retry + 1)"))?;
        let lease = Duration::from_millis(lease_ms);
        if lease <= floor {
            return Err(Error::InvalidConfig(format!(
                "lease_duration ({:?}) must exceed heartbeat_interval * (heartbeat_max_retry + 1) = {:?}",
                lease, floor
            )));
        }

        if self.heartbeat_interval_ms < RECOMMENDED_HEARTBEAT_INTERVAL_MS {
            tracing::warn!(
                "It is recommended to have heartbeat_interval_ms of {} or higher, got {}",
                RECOMMENDED_HEARTBEAT_INTERVAL_MS,
                self.heartbeat_interval_ms
            );
        }
        if self.heartbeat_max_retry < RECOMMENDED_HEARTBEAT_MAX_RETRY {
            tracing::warn!(
                "It is recommended to have heartbeat_max_retry of {} or higher, got {}",
                RECOMMENDED_HEARTBEAT_MAX_RETRY,
                self.heartbeat_max_retry
            );
        }
        Ok(())
    }
}

/// Shared database location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./coordination.db"),
        }
    }
}
