//! # rdbcoord
//!
//! Cluster coordination for processes that already share a relational
//! database:
//! - Heartbeat rows prove each node is alive
//! - A failure detector turns missed heartbeats into membership changes
//! - A leased leadership row elects exactly one leader per group
//! - Leadership and membership changes are delivered as ordered events
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   node-a     │   │   node-b     │   │   node-c     │
//! │ heartbeat ─┐ │   │ heartbeat ─┐ │   │ heartbeat ─┐ │
//! │ election ──┤ │   │ election ──┤ │   │ election ──┤ │
//! └────────────┼─┘   └────────────┼─┘   └────────────┼─┘
//!              └──────────┬───────┴──────────────────┘
//!                 ┌───────▼────────────┐
//!                 │  shared database   │
//!                 │  heartbeat         │
//!                 │  leadership        │
//!                 └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Embed in an application
//! ```no_run
//! # async fn demo() -> rdbcoord::Result<()> {
//! use rdbcoord::{Config, CoordinationStrategy};
//!
//! let config = Config::load(None)?;
//! if let Some(coord) = CoordinationStrategy::activate(&config.cluster)? {
//!     coord.subscribe(|event| println!("{:?}", event));
//!     coord.start().await?;
//!     if coord.is_leader() {
//!         // leader-only work, fenced by coord.leader_term()
//!     }
//!     coord.stop().await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Run a standalone node
//! ```bash
//! rdbcoord serve --id node-1 --db ./coordination.db --group billing
//! rdbcoord status --db ./coordination.db --group billing
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{Config, Error, NodeId, Result};
pub use coordinator::{CoordinationEvent, CoordinationStrategy, Role};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
