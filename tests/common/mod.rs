//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use rdbcoord::common::{ClusterConfig, DatabaseConfig, StrategyConfig};
use rdbcoord::coordinator::{
    CoordinationStore, HeartbeatRecord, LeadershipRecord, LeaseOutcome, SqliteStore,
};
use rdbcoord::{Error, NodeId, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store wrapper that can cut a node off from the database and counts
/// lease releases
pub struct FaultyStore {
    inner: SqliteStore,
    cut: AtomicBool,
    releases: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: SqliteStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            cut: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn cut(&self) {
        self.cut.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.cut.store(false, Ordering::SeqCst);
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.cut.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("injected fault".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for FaultyStore {
    async fn write_heartbeat(&self, node_id: &NodeId) -> Result<HeartbeatRecord> {
        self.check()?;
        self.inner.write_heartbeat(node_id).await
    }

    async fn read_all_heartbeats(&self) -> Result<Vec<HeartbeatRecord>> {
        self.check()?;
        self.inner.read_all_heartbeats().await
    }

    async fn try_acquire_or_renew_leadership(
        &self,
        node_id: &NodeId,
        lease_duration: Duration,
    ) -> Result<LeaseOutcome> {
        self.check()?;
        self.inner
            .try_acquire_or_renew_leadership(node_id, lease_duration)
            .await
    }

    async fn release_leadership(&self, node_id: &NodeId, term: i64) -> Result<()> {
        self.check()?;
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release_leadership(node_id, term).await
    }

    async fn remove_heartbeat(&self, node_id: &NodeId) -> Result<()> {
        self.check()?;
        self.inner.remove_heartbeat(node_id).await
    }

    async fn reap_heartbeat(&self, node_id: &NodeId, generation: i64) -> Result<bool> {
        self.check()?;
        self.inner.reap_heartbeat(node_id, generation).await
    }

    async fn read_leadership(&self) -> Result<Option<LeadershipRecord>> {
        self.check()?;
        self.inner.read_leadership().await
    }
}

pub fn open_store(path: &Path) -> SqliteStore {
    SqliteStore::open(path, "test-group", Duration::from_secs(2)).unwrap()
}

pub fn cluster_config(node: &str, path: &Path, interval_ms: u64) -> ClusterConfig {
    ClusterConfig {
        enabled: true,
        group_id: "test-group".into(),
        node_id: Some(node.into()),
        database: DatabaseConfig {
            path: path.to_path_buf(),
        },
        strategy_config: StrategyConfig {
            heartbeat_interval_ms: interval_ms,
            heartbeat_max_retry: 3,
            store_timeout_ms: 200,
            retry_backoff_ms: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
