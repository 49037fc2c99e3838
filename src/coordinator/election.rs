//! Leader election over the leadership lease row
//!
//! Every cycle the engine calls `try_acquire_or_renew_leadership`. A leader
//! keeps a local deadline measured from the moment its last confirmed
//! request was *sent*, minus a safety margin; if no renewal is confirmed by
//! then it steps down on its own, before any rival can acquire the expired
//! lease.

use crate::common::{retry_with_backoff, Error, NodeId, Result, StrategyConfig};
use crate::coordinator::events::CoordinationEvent;
use crate::coordinator::state::{self, SharedHandle, SharedState};
use crate::coordinator::store::{CoordinationStore, LeaseOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Election role of the local node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Follower,
    /// An acquisition attempt is in flight
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

pub struct ElectionEngine {
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
    interval: Duration,
    lease_duration: Duration,
    /// Lease time this node trusts locally: lease minus safety margin
    lease_budget: Duration,
    max_retry: u32,
    backoff: Duration,
    state: SharedHandle,
    lease_deadline: Option<Instant>,
}

impl ElectionEngine {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn CoordinationStore>,
        config: &StrategyConfig,
        state: SharedHandle,
    ) -> Self {
        let lease_duration = config.lease_duration();
        Self {
            node_id,
            store,
            interval: config.heartbeat_interval(),
            lease_duration,
            lease_budget: lease_duration.saturating_sub(config.lease_safety_margin()),
            max_retry: config.heartbeat_max_retry,
            backoff: config.retry_backoff(),
            state,
            lease_deadline: None,
        }
    }

    /// Local instant by which the lease must be renewed, while leader
    pub fn lease_deadline(&self) -> Option<Instant> {
        self.lease_deadline
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Election engine started for {}", self.node_id);

        'cycles: while !*shutdown.borrow() {
            self.run_cycle(&mut shutdown).await;

            // Sleep until the next cycle, waking early to honour the lease deadline
            let next_cycle = Instant::now() + self.interval;
            loop {
                let wake = self
                    .lease_deadline
                    .map_or(next_cycle, |deadline| deadline.min(next_cycle));
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => {}
                    _ = shutdown.changed() => break 'cycles,
                }
                let now = Instant::now();
                self.check_deadline(now);
                if now >= next_cycle {
                    break;
                }
            }
        }

        tracing::info!("Election engine stopped for {}", self.node_id);
    }

    async fn run_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let started = Instant::now();
        self.begin_attempt();

        let result = {
            let store = &self.store;
            let node = &self.node_id;
            let lease = self.lease_duration;
            let attempt = retry_with_backoff(
                move || store.try_acquire_or_renew_leadership(node, lease),
                self.max_retry,
                self.backoff,
                shutdown,
            );
            match self.lease_deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, attempt)
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Timeout(
                            "lease renewal not confirmed before the local deadline".into(),
                        ))
                    }),
                None => attempt.await,
            }
        };

        if matches!(result, Err(Error::Cancelled)) {
            return;
        }
        self.apply(result, started);
    }

    fn begin_attempt(&self) {
        let mut st = state::lock(&self.state);
        if st.role == Role::Follower {
            st.role = Role::Candidate;
        }
    }

    /// Fold the outcome of an attempt sent at `started` into the local state
    pub fn apply(&mut self, result: Result<LeaseOutcome>, started: Instant) {
        let mut st = state::lock(&self.state);
        match result {
            Ok(LeaseOutcome::Acquired { term, .. }) | Ok(LeaseOutcome::Renewed { term, .. }) => {
                self.lease_deadline = started.checked_add(self.lease_budget);
                let changed = st.role != Role::Leader
                    || st.term != term
                    || st.leader.as_ref() != Some(&self.node_id);
                st.role = Role::Leader;
                if changed {
                    tracing::info!("Node {} is now leader (term {})", self.node_id, term);
                    st.leader = Some(self.node_id.clone());
                    st.term = term;
                    st.emit(CoordinationEvent::LeaderChanged {
                        leader: Some(self.node_id.clone()),
                        term,
                    });
                }
            }
            Ok(LeaseOutcome::Denied { holder, term, .. }) => {
                self.lease_deadline = None;
                let was_leader = st.role == Role::Leader;
                st.role = Role::Follower;
                if term < st.term {
                    tracing::debug!(
                        "Ignoring stale leadership of {} (term {} < {})",
                        holder,
                        term,
                        st.term
                    );
                    return;
                }
                if st.leader.as_ref() != Some(&holder) || st.term != term {
                    if was_leader {
                        tracing::warn!(
                            "Node {} lost leadership to {} (term {})",
                            self.node_id,
                            holder,
                            term
                        );
                    } else {
                        tracing::info!("Leader is {} (term {})", holder, term);
                    }
                    st.leader = Some(holder.clone());
                    st.term = term;
                    st.emit(CoordinationEvent::LeaderChanged {
                        leader: Some(holder),
                        term,
                    });
                }
            }
            Err(e) => {
                self.lease_deadline = None;
                if st.role == Role::Leader {
                    tracing::warn!("Node {} cannot confirm its lease: {}", self.node_id, e);
                    step_down(&mut st);
                } else {
                    tracing::warn!("Leadership attempt by {} failed: {}", self.node_id, e);
                    st.role = Role::Follower;
                    if st.leader.take().is_some() {
                        st.emit(CoordinationEvent::LeaderChanged {
                            leader: None,
                            term: st.term,
                        });
                    }
                }
            }
        }
    }

    /// Step down if the local lease deadline has passed. Returns true if it did.
    pub fn check_deadline(&mut self, now: Instant) -> bool {
        match self.lease_deadline {
            Some(deadline) if now >= deadline => {
                self.lease_deadline = None;
                let mut st = state::lock(&self.state);
                if st.role == Role::Leader {
                    tracing::warn!(
                        "Node {} reached its lease deadline without renewal",
                        self.node_id
                    );
                    step_down(&mut st);
                }
                true
            }
            _ => false,
        }
    }
}

fn step_down(st: &mut SharedState) {
    st.role = Role::Follower;
    st.leader = None;
    st.emit(CoordinationEvent::LeaderChanged {
        leader: None,
        term: st.term,
    });
}
