//! Coordination store adapter
//!
//! Translates coordination primitives into relational operations on two
//! tables:
//! - `heartbeat(node_id PRIMARY KEY, last_updated, generation)`
//! - `leadership(group_id PRIMARY KEY, leader_id, lease_expiry, term)`
//!
//! The SQLite implementation runs every compare-and-swap inside a
//! `BEGIN IMMEDIATE` transaction. That takes the database RESERVED lock before
//! the row is read, so the read-modify-write of the leadership row is
//! serialized against every other writer of the same file (SQLite's
//! equivalent of `SELECT ... FOR UPDATE`).

use crate::common::{Clock, Error, NodeId, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS heartbeat (
    node_id      TEXT PRIMARY KEY,
    last_updated INTEGER NOT NULL,
    generation   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS leadership (
    group_id     TEXT PRIMARY KEY,
    leader_id    TEXT NOT NULL,
    lease_expiry INTEGER NOT NULL,
    term         INTEGER NOT NULL
);
";

/// Milliseconds since the Unix epoch as seen by the database
const DB_NOW_SQL: &str = "SELECT CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

const MAX_IDLE_CONNECTIONS: usize = 4;

/// Liveness row of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub node_id: NodeId,
    /// Store-stamped time of the last write (ms since epoch)
    pub last_updated: i64,
    /// Incremented on every write
    pub generation: i64,
}

/// The singleton leadership row of a coordination group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipRecord {
    pub group_id: String,
    pub leader_id: NodeId,
    pub lease_expiry: i64,
    pub term: i64,
}

/// Result of an acquire-or-renew attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The lease was free or expired; `term` is new
    Acquired { term: i64, lease_expiry: i64 },
    /// This node already held the lease; same term, later expiry
    Renewed { term: i64, lease_expiry: i64 },
    /// Another node holds an unexpired lease
    Denied {
        holder: NodeId,
        term: i64,
        lease_expiry: i64,
    },
}

impl LeaseOutcome {
    pub fn term(&self) -> i64 {
        match self {
            LeaseOutcome::Acquired { term, .. }
            | LeaseOutcome::Renewed { term, .. }
            | LeaseOutcome::Denied { term, .. } => *term,
        }
    }

    /// The term, if this node holds the lease
    pub fn held_term(&self) -> Result<i64> {
        match self {
            LeaseOutcome::Acquired { term, .. } | LeaseOutcome::Renewed { term, .. } => Ok(*term),
            LeaseOutcome::Denied { holder, term, .. } => Err(Error::StateConflict {
                holder: holder.to_string(),
                term: *term,
            }),
        }
    }
}

/// Coordination primitives over the shared store
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Create or renew this node's heartbeat row; returns the row as written
    async fn write_heartbeat(&self, node_id: &NodeId) -> Result<HeartbeatRecord>;

    async fn read_all_heartbeats(&self) -> Result<Vec<HeartbeatRecord>>;

    /// Atomic acquire-or-renew of the leadership lease
    async fn try_acquire_or_renew_leadership(
        &self,
        node_id: &NodeId,
        lease_duration: Duration,
    ) -> Result<LeaseOutcome>;

    /// Expire the lease if it is still held by `node_id` at `term`
    async fn release_leadership(&self, node_id: &NodeId, term: i64) -> Result<()>;

    /// Delete a heartbeat row; succeeds if it is already gone
    async fn remove_heartbeat(&self, node_id: &NodeId) -> Result<()>;

    /// Delete a peer's row only if it has not been renewed since `generation`
    async fn reap_heartbeat(&self, node_id: &NodeId, generation: i64) -> Result<bool>;

    async fn read_leadership(&self) -> Result<Option<LeadershipRecord>>;
}

/// Where "now" comes from when stamping rows
#[derive(Clone)]
pub enum TimeSource {
    /// The database clock (single source of truth across nodes)
    Database,
    /// An injected clock, for simulations
    Clock(Arc<dyn Clock>),
}

impl TimeSource {
    fn now(&self, conn: &Connection) -> Result<i64> {
        match self {
            TimeSource::Database => Ok(conn.query_row(DB_NOW_SQL, [], |row| row.get(0))?),
            TimeSource::Clock(clock) => Ok(clock.now_millis()),
        }
    }
}

struct ConnectionPool {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    fn checkout(&self) -> Result<Connection> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => open_connection(&self.path, self.busy_timeout),
        }
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// SQLite-backed coordination store shared by every node that opens the same
/// database file.
///
/// Each call checks out its own connection, so a slow heartbeat write never
/// holds up a lease renewal issued concurrently by the same process.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<ConnectionPool>,
    group_id: String,
    time: TimeSource,
    call_timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the coordination tables in `path`
    pub fn open(
        path: impl AsRef<Path>,
        group_id: impl Into<String>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path, call_timeout)?;
        conn.execute_batch(SCHEMA)?;

        let pool = ConnectionPool {
            path,
            busy_timeout: call_timeout,
            idle: Mutex::new(vec![conn]),
        };

        Ok(Self {
            pool: Arc::new(pool),
            group_id: group_id.into(),
            time: TimeSource::Database,
            call_timeout,
        })
    }

    /// Stamp rows with `clock` instead of the database clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.time = TimeSource::Clock(clock);
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Run a blocking closure on the blocking pool, bounded by the call timeout
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &TimeSource) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let time = self.time.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = pool.checkout()?;
            let result = f(&mut conn, &time);
            pool.checkin(conn);
            result
        });

        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(Error::Timeout(format!(
                "{} exceeded {:?}",
                op, self.call_timeout
            ))),
        }
    }
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn write_heartbeat(&self, node_id: &NodeId) -> Result<HeartbeatRecord> {
        let node = node_id.to_string();
        self.run("write_heartbeat", move |conn, time| {
            let now = time.now(conn)?;
            let record = conn.query_row(
                "INSERT INTO heartbeat (node_id, last_updated, generation) VALUES (?1, ?2, 1)
                 ON CONFLICT(node_id) DO UPDATE SET
                     last_updated = excluded.last_updated,
                     generation = heartbeat.generation + 1
                 RETURNING node_id, last_updated, generation",
                params![node, now],
                |row| {
                    Ok(HeartbeatRecord {
                        node_id: NodeId::new(row.get::<_, String>(0)?),
                        last_updated: row.get(1)?,
                        generation: row.get(2)?,
                    })
                },
            )?;
            Ok(record)
        })
        .await
    }

    async fn read_all_heartbeats(&self) -> Result<Vec<HeartbeatRecord>> {
        self.run("read_all_heartbeats", |conn, _| {
            let mut stmt = conn.prepare_cached(
                "SELECT node_id, last_updated, generation FROM heartbeat ORDER BY node_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(HeartbeatRecord {
                    node_id: NodeId::new(row.get::<_, String>(0)?),
                    last_updated: row.get(1)?,
                    generation: row.get(2)?,
                })
            })?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await
    }

    async fn try_acquire_or_renew_leadership(
        &self,
        node_id: &NodeId,
        lease_duration: Duration,
    ) -> Result<LeaseOutcome> {
        let node = node_id.clone();
        let group = self.group_id.clone();
        let lease_ms = lease_duration.as_millis() as i64;

        self.run("try_acquire_or_renew_leadership", move |conn, time| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = time.now(&tx)?;
            let current: Option<(String, i64, i64)> = tx
                .query_row(
                    "SELECT leader_id, lease_expiry, term FROM leadership WHERE group_id = ?1",
                    params![group],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let lease_expiry = now + lease_ms;
            let outcome = match current {
                Some((leader, expiry, term)) if expiry >= now && leader == node.as_str() => {
                    tx.execute(
                        "UPDATE leadership SET lease_expiry = ?1 WHERE group_id = ?2",
                        params![lease_expiry, group],
                    )?;
                    LeaseOutcome::Renewed { term, lease_expiry }
                }
                Some((leader, expiry, term)) if expiry >= now => LeaseOutcome::Denied {
                    holder: NodeId::new(leader),
                    term,
                    lease_expiry: expiry,
                },
                current => {
                    let term = current.map_or(0, |(_, _, term)| term) + 1;
                    tx.execute(
                        "INSERT INTO leadership (group_id, leader_id, lease_expiry, term)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(group_id) DO UPDATE SET
                             leader_id = excluded.leader_id,
                             lease_expiry = excluded.lease_expiry,
                             term = excluded.term",
                        params![group, node.as_str(), lease_expiry, term],
                    )?;
                    LeaseOutcome::Acquired { term, lease_expiry }
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn release_leadership(&self, node_id: &NodeId, term: i64) -> Result<()> {
        let node = node_id.to_string();
        let group = self.group_id.clone();
        self.run("release_leadership", move |conn, time| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = time.now(&tx)?;
            tx.execute(
                "UPDATE leadership SET lease_expiry = MIN(lease_expiry, ?1)
                 WHERE group_id = ?2 AND leader_id = ?3 AND term = ?4",
                params![now - 1, group, node, term],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove_heartbeat(&self, node_id: &NodeId) -> Result<()> {
        let node = node_id.to_string();
        self.run("remove_heartbeat", move |conn, _| {
            conn.execute("DELETE FROM heartbeat WHERE node_id = ?1", params![node])?;
            Ok(())
        })
        .await
    }

    async fn reap_heartbeat(&self, node_id: &NodeId, generation: i64) -> Result<bool> {
        let node = node_id.to_string();
        self.run("reap_heartbeat", move |conn, _| {
            let deleted = conn.execute(
                "DELETE FROM heartbeat WHERE node_id = ?1 AND generation = ?2",
                params![node, generation],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn read_leadership(&self) -> Result<Option<LeadershipRecord>> {
        let group = self.group_id.clone();
        self.run("read_leadership", move |conn, _| {
            let record = conn
                .query_row(
                    "SELECT group_id, leader_id, lease_expiry, term FROM leadership
                     WHERE group_id = ?1",
                    params![group],
                    |row| {
                        Ok(LeadershipRecord {
                            group_id: row.get(0)?,
                            leader_id: NodeId::new(row.get::<_, String>(1)?),
                            lease_expiry: row.get(2)?,
                            term: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await
    }
}
