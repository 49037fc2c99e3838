//! Heartbeat engine: proves local liveness and reads everyone else's

use crate::common::{retry_with_backoff, Error, NodeId, StrategyConfig};
use crate::coordinator::detector::{FailureDetector, Observation, Transition};
use crate::coordinator::events::CoordinationEvent;
use crate::coordinator::state::{self, SharedHandle, SharedState};
use crate::coordinator::store::CoordinationStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

pub struct HeartbeatEngine {
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
    interval: Duration,
    max_retry: u32,
    backoff: Duration,
    state: SharedHandle,
    detector: FailureDetector,
    consecutive_failures: u32,
}

impl HeartbeatEngine {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn CoordinationStore>,
        config: &StrategyConfig,
        state: SharedHandle,
    ) -> Self {
        Self {
            detector: FailureDetector::new(node_id.clone(), config),
            node_id,
            store,
            interval: config.heartbeat_interval(),
            max_retry: config.heartbeat_max_retry,
            backoff: config.retry_backoff(),
            state,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Heartbeat engine started for {} (every {:?})",
            self.node_id,
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if !self.run_cycle(&mut shutdown).await {
                break;
            }
        }

        tracing::info!("Heartbeat engine stopped for {}", self.node_id);
    }

    /// One write + read + detect round. Returns false if shutdown interrupted it.
    pub async fn run_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let store = &self.store;
        let node = &self.node_id;

        let written = retry_with_backoff(
            move || store.write_heartbeat(node),
            self.max_retry,
            self.backoff,
            shutdown,
        )
        .await;
        let store_now = match written {
            Ok(record) => {
                if self.consecutive_failures > 0 {
                    tracing::info!(
                        "Heartbeat of {} restored after {} failed cycles",
                        self.node_id,
                        self.consecutive_failures
                    );
                    self.consecutive_failures = 0;
                    state::lock(&self.state).emit(CoordinationEvent::SelfRecovered);
                }
                Some(record.last_updated)
            }
            Err(Error::Cancelled) => return false,
            Err(e) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    "Node {} could not write its heartbeat ({} consecutive failures): {}",
                    self.node_id,
                    self.consecutive_failures,
                    e
                );
                if self.consecutive_failures == 1 {
                    state::lock(&self.state).emit(CoordinationEvent::SelfDegraded {
                        consecutive_failures: self.consecutive_failures,
                    });
                }
                None
            }
        };

        let store = &self.store;
        let read = retry_with_backoff(
            move || store.read_all_heartbeats(),
            self.max_retry,
            self.backoff,
            shutdown,
        )
        .await;

        let observation = {
            let now = Instant::now();
            let mut st = state::lock(&self.state);
            let observation = match read {
                Ok(records) => {
                    st.snapshot = records
                        .iter()
                        .map(|r| (r.node_id.clone(), r.last_updated))
                        .collect();
                    self.detector.observe(&records, store_now, now)
                }
                Err(Error::Cancelled) => return false,
                Err(e) => {
                    tracing::warn!("Node {} could not read heartbeats: {}", self.node_id, e);
                    self.detector.tick(now)
                }
            };
            publish(&mut st, &observation);
            st.members = self.detector.members();
            observation
        };

        for (peer, generation) in observation.reap {
            match self.store.reap_heartbeat(&peer, generation).await {
                Ok(true) => tracing::info!("Removed heartbeat row of dead node {}", peer),
                Ok(false) => tracing::debug!("Heartbeat row of {} already gone or renewed", peer),
                Err(e) => tracing::debug!("Could not remove heartbeat row of {}: {}", peer, e),
            }
        }

        true
    }
}

fn publish(st: &mut SharedState, observation: &Observation) {
    for transition in &observation.transitions {
        match transition {
            Transition::Joined(id) => {
                tracing::info!("Member joined: {}", id);
                st.emit(CoordinationEvent::MemberJoined { node_id: id.clone() });
            }
            Transition::Left(id) => {
                tracing::warn!("Member left: {}", id);
                st.emit(CoordinationEvent::MemberLeft { node_id: id.clone() });
            }
            Transition::Suspected(id) => tracing::debug!("Member suspected: {}", id),
            Transition::Recovered(id) => tracing::debug!("Member recovered: {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use crate::coordinator::events::EventBus;
    use crate::coordinator::store::SqliteStore;
    use std::sync::Mutex;

    fn config() -> StrategyConfig {
        StrategyConfig {
            heartbeat_interval_ms: 50,
            heartbeat_max_retry: 2,
            store_timeout_ms: 1000,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cycle_writes_and_sees_self() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(1_000);
        let store = Arc::new(
            SqliteStore::open(dir.path().join("hb.db"), "g", Duration::from_secs(5))
                .unwrap()
                .with_clock(Arc::new(clock.clone())),
        );

        let bus = EventBus::new();
        let mut rx = bus.channel();
        let (sender, _task) = bus.spawn_dispatcher();
        let state: SharedHandle = Arc::new(Mutex::new(SharedState::default()));
        state.lock().unwrap().attach(sender);

        let me = NodeId::new("me");
        store.write_heartbeat(&NodeId::new("peer")).await.unwrap();

        let mut engine = HeartbeatEngine::new(me.clone(), store.clone(), &config(), state.clone());
        let (_tx, mut shutdown) = watch::channel(false);
        assert!(engine.run_cycle(&mut shutdown).await);

        {
            let st = state.lock().unwrap();
            assert!(st.members.contains(&me));
            assert!(st.members.contains(&NodeId::new("peer")));
            assert_eq!(st.snapshot.get(&me), Some(&1_000));
        }
        assert_eq!(
            rx.recv().await,
            Some(CoordinationEvent::MemberJoined { node_id: me })
        );
        assert_eq!(
            rx.recv().await,
            Some(CoordinationEvent::MemberJoined {
                node_id: NodeId::new("peer")
            })
        );
        assert_eq!(engine.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_reports_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SqliteStore::open(dir.path().join("hb.db"), "g", Duration::from_secs(5)).unwrap(),
        );
        let state: SharedHandle = Arc::new(Mutex::new(SharedState::default()));
        let mut engine = HeartbeatEngine::new(NodeId::new("me"), store, &config(), state);

        let (tx, mut shutdown) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!engine.run_cycle(&mut shutdown).await);
    }
}
