//! Heartbeat-based failure detector
//!
//! Each peer moves between three states:
//!
//! ```text
//!            elapsed > interval          elapsed > interval * max_retry
//!   Alive  ─────────────────────▶ Suspected ─────────────────────────▶ Dead
//!     ▲                               │                                 │
//!     └────── newer heartbeat ────────┴──────── newer heartbeat ────────┘
//! ```
//!
//! "Elapsed" is measured on the local monotonic clock from the moment a
//! changed heartbeat row was first observed. Store timestamps are only
//! compared with each other, never with the local wall clock.

use crate::common::{MissPolicy, NodeId, StrategyConfig};
use crate::coordinator::store::HeartbeatRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Liveness belief about one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Alive,
    Suspected,
    Dead,
}

impl PeerState {
    /// Suspected peers are still members; only Dead removes them
    pub fn is_member(&self) -> bool {
        matches!(self, PeerState::Alive | PeerState::Suspected)
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Alive => write!(f, "alive"),
            PeerState::Suspected => write!(f, "suspected"),
            PeerState::Dead => write!(f, "dead"),
        }
    }
}

/// State change produced by one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Previously unknown (or dead) peer is alive
    Joined(NodeId),
    /// Alive peer missed one interval
    Suspected(NodeId),
    /// Suspected peer heartbeated again
    Recovered(NodeId),
    /// Peer declared dead
    Left(NodeId),
}

/// What the heartbeat engine should act on after an observation
#[derive(Debug, Default)]
pub struct Observation {
    pub transitions: Vec<Transition>,
    /// Rows of dead peers to delete: (node, generation seen)
    pub reap: Vec<(NodeId, i64)>,
}

#[derive(Debug)]
struct PeerEntry {
    state: PeerState,
    last_updated: i64,
    generation: i64,
    last_change: Instant,
}

pub struct FailureDetector {
    local: NodeId,
    interval: Duration,
    failure_timeout: Duration,
    policy: MissPolicy,
    peers: HashMap<NodeId, PeerEntry>,
}

impl FailureDetector {
    pub fn new(local: NodeId, config: &StrategyConfig) -> Self {
        Self {
            local,
            interval: config.heartbeat_interval(),
            failure_timeout: config.failure_timeout(),
            policy: config.miss_policy,
            peers: HashMap::new(),
        }
    }

    pub fn state(&self, node_id: &NodeId) -> Option<PeerState> {
        self.peers.get(node_id).map(|p| p.state)
    }

    /// Peers currently believed alive (Alive or Suspected)
    pub fn members(&self) -> BTreeSet<NodeId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.state.is_member())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Feed a full read of the heartbeat table.
    ///
    /// `store_now` is the store-stamped time of this node's own latest write,
    /// when known; it back-dates first sightings so a long-stale row is never
    /// announced as a join.
    pub fn observe(
        &mut self,
        records: &[HeartbeatRecord],
        store_now: Option<i64>,
        now: Instant,
    ) -> Observation {
        let mut out = Observation::default();
        let mut seen = HashSet::with_capacity(records.len());
        let interval_ms = self.interval.as_millis() as i64;

        for record in records {
            seen.insert(record.node_id.clone());

            match self.peers.get_mut(&record.node_id) {
                None => {
                    let age = store_now
                        .map(|s| Duration::from_millis((s - record.last_updated).max(0) as u64))
                        .unwrap_or_default();
                    if age > self.failure_timeout {
                        tracing::debug!("Ignoring stale heartbeat row of {}", record.node_id);
                        self.peers.insert(
                            record.node_id.clone(),
                            PeerEntry {
                                state: PeerState::Dead,
                                last_updated: record.last_updated,
                                generation: record.generation,
                                last_change: now,
                            },
                        );
                        continue;
                    }
                    self.peers.insert(
                        record.node_id.clone(),
                        PeerEntry {
                            state: PeerState::Alive,
                            last_updated: record.last_updated,
                            generation: record.generation,
                            last_change: now.checked_sub(age).unwrap_or(now),
                        },
                    );
                    out.transitions.push(Transition::Joined(record.node_id.clone()));
                }
                Some(entry) => {
                    let changed = entry.last_updated != record.last_updated
                        || entry.generation != record.generation;
                    if !changed {
                        continue;
                    }
                    entry.last_updated = record.last_updated;
                    entry.generation = record.generation;

                    let fresh = match self.policy {
                        MissPolicy::ResetOnSuccess => true,
                        MissPolicy::RequireFreshRead => store_now
                            .map_or(true, |s| s - record.last_updated <= interval_ms),
                    };
                    if !fresh {
                        continue;
                    }

                    entry.last_change = now;
                    match entry.state {
                        PeerState::Alive => {}
                        PeerState::Suspected => {
                            out.transitions.push(Transition::Recovered(record.node_id.clone()))
                        }
                        PeerState::Dead => {
                            out.transitions.push(Transition::Joined(record.node_id.clone()))
                        }
                    }
                    entry.state = PeerState::Alive;
                }
            }
        }

        // Rows that vanished were removed by a clean leave or reaped elsewhere
        let mut vanished = Vec::new();
        for (id, entry) in &self.peers {
            if !seen.contains(id) {
                vanished.push((id.clone(), entry.state));
            }
        }
        vanished.sort_by(|a, b| a.0.cmp(&b.0));
        for (id, state) in vanished {
            self.peers.remove(&id);
            if state != PeerState::Dead {
                out.transitions.push(Transition::Left(id));
            }
        }

        self.age(now, &mut out);

        // Retry reaping rows of dead peers until they are gone
        for (id, entry) in &self.peers {
            if entry.state == PeerState::Dead && *id != self.local {
                out.reap.push((id.clone(), entry.generation));
            }
        }

        out
    }

    /// Advance time without a fresh read (the read failed)
    pub fn tick(&mut self, now: Instant) -> Observation {
        let mut out = Observation::default();
        self.age(now, &mut out);
        out
    }

    fn age(&mut self, now: Instant, out: &mut Observation) {
        let mut ids: Vec<&NodeId> = self.peers.keys().collect();
        ids.sort();
        let ids: Vec<NodeId> = ids.into_iter().cloned().collect();

        for id in ids {
            let Some(entry) = self.peers.get_mut(&id) else {
                continue;
            };
            let elapsed = now.saturating_duration_since(entry.last_change);
            match entry.state {
                PeerState::Dead => {}
                state if elapsed > self.failure_timeout => {
                    if state == PeerState::Alive {
                        out.transitions.push(Transition::Suspected(id.clone()));
                    }
                    entry.state = PeerState::Dead;
                    out.transitions.push(Transition::Left(id));
                }
                PeerState::Alive if elapsed > self.interval => {
                    entry.state = PeerState::Suspected;
                    out.transitions.push(Transition::Suspected(id));
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(interval_ms: u64, max_retry: u32) -> StrategyConfig {
        StrategyConfig {
            heartbeat_interval_ms: interval_ms,
            heartbeat_max_retry: max_retry,
            ..Default::default()
        }
    }

    fn hb(id: &str, last_updated: i64, generation: i64) -> HeartbeatRecord {
        HeartbeatRecord {
            node_id: NodeId::new(id),
            last_updated,
            generation,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_first_sighting_joins() {
        let mut fd = FailureDetector::new(NodeId::new("self"), &config(1000, 3));
        let t0 = Instant::now();
        let obs = fd.observe(&[hb("a", 100, 1)], Some(100), t0);
        assert_eq!(obs.transitions, vec![Transition::Joined(NodeId::new("a"))]);
        assert_eq!(fd.state(&NodeId::new("a")), Some(PeerState::Alive));
        assert!(obs.reap.is_empty());
    }

    #[test]
    fn test_stale_row_never_joins() {
        let mut fd = FailureDetector::new(NodeId::new("self"), &config(1000, 3));
        let t0 = Instant::now();
        let obs = fd.observe(&[hb("ghost", 0, 9)], Some(60_000), t0);
        assert!(obs.transitions.is_empty());
        assert_eq!(obs.reap, vec![(NodeId::new("ghost"), 9)]);
        assert!(fd.members().is_empty());
    }

    #[test]
    fn test_suspected_then_dead_exactly_once() {
        let mut fd = FailureDetector::new(NodeId::new("self"), &config(1000, 3));
        let t0 = Instant::now();
        let rows = [hb("a", 0, 1)];
        let mut all = fd.observe(&rows, Some(0), t0).transitions;

        for step in 1..=12 {
            all.extend(fd.observe(&rows, None, t0 + ms(step * 500)).transitions);
        }

        let a = NodeId::new("a");
        assert_eq!(
            all,
            vec![
                Transition::Joined(a.clone()),
                Transition::Suspected(a.clone()),
                Transition::Left(a.clone()),
            ]
        );
        assert_eq!(fd.state(&a), Some(PeerState::Dead));
    }

    #[test]
    fn test_dead_boundary() {
        let mut fd = FailureDetector::new(NodeId::new("self"), &config(1000, 3));
        let t0 = Instant::now();
        let a = NodeId::new("a");
        let rows = [hb("a", 0, 1)];
        fd.observe(&rows, Some(0), t0);

        fd.observe(&rows, None, t0 + ms(1000));
        assert_eq!(fd.state(&a), Some(PeerState::Alive));
        fd.observe(&rows, None, t0 + ms(1001));
        assert_eq!(fd.state(&a), Some(PeerState::Suspected));
        fd.observe(&rows, None, t0 + ms(3000));
        assert_eq!(fd.state(&a), Some(PeerState::Suspected));
        let obs = fd.observe(&rows, None, t0 + ms(3001));
        assert_eq!(fd.state(&a), Some(PeerState::Dead));
        assert_eq!(obs.transitions, vec![Transition::Left(a.clone())]);
        assert_eq!(obs.reap, vec![(a, 1)]);
    }

    #[test]
    fn test_newer_heartbeat_recovers_from_suspected() {
        let mut fd = FailureDetector::new(NodeId::new("self"), &config(1000, 3));
        let t0 = Instant::now();
        let a = NodeId::new("a");
        fd.observe(&[hb("a", 0, 1)], Some(0), t0);
        fd.observe(&[hb("a", 0, 1)], None, t0 + ms(1500));
        assert_eq!(fd.state(&a), Some(PeerState::Suspected));

        let obs = fd.observe(&[hb("a", 1500, 2)], Some(1500), t0 + ms(1600));
        assert_eq!(obs.transitions, vec![Transition::Recovered(a.clone())]);
        assert_eq!(fd.state(&a), Some(PeerState::Alive));
        assert!(fd.members().contains(&a));
    }

    #[test]
    fn test_dead_peer_rejoins() {
        let mut fd = FailureDetector::new(NodeId::new("self"), &config(1000, 3));
        let t0 = Instant::now();
        let a = NodeId::new("a");
        fd.observe(&[hb("a", 0, 1)], Some(0), t0);
        fd.observe(&[hb("a", 0, 1)], None, t0 + ms(4000));
        assert_eq!(fd.state(&a), Some(PeerState::Dead));

        let obs = fd.observe(&[hb("a", 5000, 2)], Some(5000), t0 + ms(5000));
        assert_eq!(obs.transitions, vec![Transition::Joined(a.clone())]);
    }

    #[test]
    fn test_vanished_row_leaves() {
        let mut fd = FailureDetector::new(NodeId::new("self"), &config(1000, 3));
        let t0 = Instant::now();
        fd.observe(&[hb("a", 0, 1), hb("b", 0, 1)], Some(0), t0);
        let obs = fd.observe(&[hb("b", 500, 2)], Some(500), t0 + ms(500));
        assert_eq!(obs.transitions, vec![Transition::Left(NodeId::new("a"))]);
        assert_eq!(fd.state(&NodeId::new("a")), None);
    }

    #[test]
    fn test_local_row_never_reaped() {
        let me = NodeId::new("self");
        let mut fd = FailureDetector::new(me.clone(), &config(1000, 3));
        let t0 = Instant::now();
        fd.observe(&[hb("self", 0, 1)], Some(0), t0);
        let obs = fd.observe(&[hb("self", 0, 1)], None, t0 + ms(5000));
        assert_eq!(
            obs.transitions,
            vec![Transition::Suspected(me.clone()), Transition::Left(me)]
        );
        assert!(obs.reap.is_empty());
    }

    #[test]
    fn test_require_fresh_read_ignores_late_updates() {
        let cfg = StrategyConfig {
            miss_policy: MissPolicy::RequireFreshRead,
            ..config(1000, 3)
        };
        let mut fd = FailureDetector::new(NodeId::new("self"), &cfg);
        let t0 = Instant::now();
        let a = NodeId::new("a");
        fd.observe(&[hb("a", 0, 1)], Some(0), t0);
        fd.observe(&[hb("a", 0, 1)], None, t0 + ms(1500));
        assert_eq!(fd.state(&a), Some(PeerState::Suspected));

        // Row changed, but was written 1.4s before our own write
        fd.observe(&[hb("a", 100, 2)], Some(1500), t0 + ms(1600));
        assert_eq!(fd.state(&a), Some(PeerState::Suspected));

        fd.observe(&[hb("a", 1700, 3)], Some(1800), t0 + ms(1800));
        assert_eq!(fd.state(&a), Some(PeerState::Alive));
    }

    #[test]
    fn test_tick_ages_without_read() {
        let mut fd = FailureDetector::new(NodeId::new("self"), &config(1000, 3));
        let t0 = Instant::now();
        fd.observe(&[hb("a", 0, 1)], Some(0), t0);
        let obs = fd.tick(t0 + ms(3500));
        let a = NodeId::new("a");
        assert_eq!(
            obs.transitions,
            vec![Transition::Suspected(a.clone()), Transition::Left(a)]
        );
        assert!(fd.members().is_empty());
    }
}
