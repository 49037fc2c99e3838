//! Common utilities and types shared across rdbcoord

pub mod config;
pub mod error;
pub mod node;
pub mod utils;

pub use config::{ClusterConfig, Config, DatabaseConfig, MissPolicy, StrategyConfig};
pub use error::{Error, Result};
pub use node::NodeId;
pub use utils::{
    format_millis, parse_duration, retry_with_backoff, timestamp_now_millis, Clock, ManualClock,
};
