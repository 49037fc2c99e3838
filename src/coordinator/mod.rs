//! Coordination over a shared relational database
//!
//! The coordinator is responsible for:
//! - Liveness heartbeats (one row per node)
//! - Failure detection from the heartbeat table
//! - Leader election via a leased leadership row
//! - Ordered delivery of leadership and membership events

pub mod detector;
pub mod election;
pub mod events;
pub mod heartbeat;
pub mod state;
pub mod store;
pub mod strategy;

pub use detector::{FailureDetector, PeerState};
pub use election::Role;
pub use events::{CoordinationEvent, SubscriptionId};
pub use store::{CoordinationStore, HeartbeatRecord, LeadershipRecord, LeaseOutcome, SqliteStore};
pub use strategy::CoordinationStrategy;
