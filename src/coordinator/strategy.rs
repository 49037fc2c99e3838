//! Coordination strategy facade
//!
//! Owns the lifecycle of the heartbeat engine, the election engine and the
//! event dispatcher, and answers the host application's questions about
//! leadership and membership from the shared local state.

use crate::common::config::RDBMS_STRATEGY;
use crate::common::{ClusterConfig, Error, NodeId, Result, StrategyConfig};
use crate::coordinator::election::{ElectionEngine, Role};
use crate::coordinator::events::{CoordinationEvent, EventBus, SubscriptionId};
use crate::coordinator::heartbeat::HeartbeatEngine;
use crate::coordinator::state::{self, SharedHandle, SharedState};
use crate::coordinator::store::{CoordinationStore, SqliteStore};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct RunningTasks {
    shutdown: watch::Sender<bool>,
    heartbeat: JoinHandle<()>,
    election: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

enum Lifecycle {
    Idle,
    Running(RunningTasks),
}

pub struct CoordinationStrategy {
    node_id: NodeId,
    config: StrategyConfig,
    store: Arc<dyn CoordinationStore>,
    state: SharedHandle,
    events: EventBus,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl CoordinationStrategy {
    pub fn new(
        node_id: NodeId,
        config: StrategyConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            node_id,
            config,
            store,
            state: Arc::new(Mutex::new(SharedState::default())),
            events: EventBus::new(),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
        })
    }

    /// Build the strategy from cluster configuration, opening the SQLite
    /// store it names. Returns `None` when coordination is disabled or a
    /// different strategy is selected.
    pub fn activate(cluster: &ClusterConfig) -> Result<Option<Self>> {
        if !is_selected(cluster) {
            return Ok(None);
        }
        let store = SqliteStore::open(
            &cluster.database.path,
            cluster.group_id.clone(),
            cluster.strategy_config.store_timeout(),
        )?;
        Self::activate_with_store(cluster, Arc::new(store))
    }

    /// Like [`activate`](Self::activate) with an already opened store
    pub fn activate_with_store(
        cluster: &ClusterConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<Option<Self>> {
        if !is_selected(cluster) {
            return Ok(None);
        }
        let node_id = cluster
            .node_id
            .clone()
            .map(NodeId::from)
            .unwrap_or_else(NodeId::generate);
        let strategy = Self::new(node_id, cluster.strategy_config.clone(), store)?;
        tracing::info!(
            "RDBMS coordination strategy activated for node {} in group {}",
            strategy.node_id,
            cluster.group_id
        );
        Ok(Some(strategy))
    }

    /// Spawn the heartbeat and election cycles. Calling it while running is a
    /// no-op.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            tracing::debug!("Coordination for {} already running", self.node_id);
            return Ok(());
        }

        let (sender, dispatcher) = self.events.spawn_dispatcher();
        {
            let mut st = state::lock(&self.state);
            *st = SharedState::default();
            st.attach(sender);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let heartbeat = HeartbeatEngine::new(
            self.node_id.clone(),
            self.store.clone(),
            &self.config,
            self.state.clone(),
        );
        let election = ElectionEngine::new(
            self.node_id.clone(),
            self.store.clone(),
            &self.config,
            self.state.clone(),
        );

        *lifecycle = Lifecycle::Running(RunningTasks {
            shutdown,
            heartbeat: tokio::spawn(heartbeat.run(shutdown_rx.clone())),
            election: tokio::spawn(election.run(shutdown_rx)),
            dispatcher,
        });

        tracing::info!(
            "Coordination started for {} (heartbeat {:?}, lease {:?})",
            self.node_id,
            self.config.heartbeat_interval(),
            self.config.lease_duration()
        );
        Ok(())
    }

    /// Stop both cycles, release leadership if held and remove this node's
    /// heartbeat row. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let tasks = match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            Lifecycle::Running(tasks) => tasks,
            Lifecycle::Idle => {
                tracing::debug!("Coordination for {} already stopped", self.node_id);
                return Ok(());
            }
        };

        let _ = tasks.shutdown.send(true);
        for (name, handle) in [("heartbeat", tasks.heartbeat), ("election", tasks.election)] {
            if let Err(e) = handle.await {
                tracing::error!("{} task of {} failed: {}", name, self.node_id, e);
            }
        }

        let held_term = {
            let mut st = state::lock(&self.state);
            let held = (st.role == Role::Leader).then_some(st.term);
            if held.is_some() {
                st.role = Role::Follower;
                st.leader = None;
                st.emit(CoordinationEvent::LeaderChanged {
                    leader: None,
                    term: st.term,
                });
            }
            st.role = Role::Follower;
            st.members.clear();
            held
        };

        let mut first_error: Option<Error> = None;
        if let Some(term) = held_term {
            match self.store.release_leadership(&self.node_id, term).await {
                Ok(()) => tracing::info!("Node {} released leadership (term {})", self.node_id, term),
                Err(e) => {
                    tracing::warn!("Node {} could not release leadership: {}", self.node_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Err(e) = self.store.remove_heartbeat(&self.node_id).await {
            tracing::warn!("Node {} could not remove its heartbeat: {}", self.node_id, e);
            first_error.get_or_insert(e);
        }

        state::lock(&self.state).detach();
        if let Err(e) = tasks.dispatcher.await {
            tracing::error!("Event dispatcher of {} failed: {}", self.node_id, e);
        }

        tracing::info!("Coordination stopped for {}", self.node_id);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        state::lock(&self.state).role == Role::Leader
    }

    pub fn role(&self) -> Role {
        state::lock(&self.state).role
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        state::lock(&self.state).leader.clone()
    }

    /// Highest term observed locally
    pub fn term(&self) -> i64 {
        state::lock(&self.state).term
    }

    /// Term of the lease this node holds, for fencing leader-only work
    pub fn leader_term(&self) -> Result<i64> {
        let st = state::lock(&self.state);
        if st.role == Role::Leader {
            return Ok(st.term);
        }
        Err(Error::StateConflict {
            holder: st
                .leader
                .as_ref()
                .map_or_else(|| "unknown".to_string(), NodeId::to_string),
            term: st.term,
        })
    }

    /// Nodes currently believed alive
    pub fn members(&self) -> BTreeSet<NodeId> {
        state::lock(&self.state).members.clone()
    }

    /// node -> store-stamped time of its last heartbeat, as of the last read
    pub fn current_snapshot(&self) -> HashMap<NodeId, i64> {
        state::lock(&self.state).snapshot.clone()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CoordinationEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Receive events over a channel instead of a callback
    pub fn event_stream(&self) -> mpsc::UnboundedReceiver<CoordinationEvent> {
        self.events.channel()
    }
}

fn is_selected(cluster: &ClusterConfig) -> bool {
    if !cluster.enabled {
        tracing::info!(
            "Cluster coordination has been disabled. Set cluster.enabled to use the clustering service"
        );
        return false;
    }
    if cluster.coordination_strategy_class != RDBMS_STRATEGY {
        tracing::warn!(
            "No such coordination strategy found: {}",
            cluster.coordination_strategy_class
        );
        return false;
    }
    true
}
