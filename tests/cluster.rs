//! Three coordinated nodes sharing one SQLite file

mod common;

use common::{cluster_config, open_store, wait_for, FaultyStore};
use rdbcoord::coordinator::{CoordinationStore, LeaseOutcome};
use rdbcoord::{CoordinationEvent, CoordinationStrategy, NodeId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;

const INTERVAL_MS: u64 = 200;

struct Node {
    strategy: CoordinationStrategy,
    store: Arc<FaultyStore>,
    events: Arc<Mutex<Vec<CoordinationEvent>>>,
}

fn spawn_node(dir: &TempDir, id: &str) -> Node {
    let path = dir.path().join("cluster.db");
    let store = FaultyStore::new(open_store(&path));
    let strategy = CoordinationStrategy::activate_with_store(
        &cluster_config(id, &path, INTERVAL_MS),
        store.clone(),
    )
    .unwrap()
    .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    strategy.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
    Node {
        strategy,
        store,
        events,
    }
}

fn leaders(nodes: &[Node]) -> Vec<NodeId> {
    nodes
        .iter()
        .filter(|n| n.strategy.is_leader())
        .map(|n| n.strategy.node_id().clone())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_leader_and_failover() {
    let dir = TempDir::new().unwrap();
    let nodes: Vec<Node> = ["node-a", "node-b", "node-c"]
        .iter()
        .map(|id| spawn_node(&dir, id))
        .collect();
    for node in &nodes {
        assert_ok!(node.strategy.start().await);
    }

    let elected = wait_for(Duration::from_millis(2 * INTERVAL_MS), || {
        leaders(&nodes).len() == 1
    })
    .await;
    assert!(elected, "no leader within two heartbeat intervals");

    // Everyone converges on the same leader and the full membership
    let leader = leaders(&nodes)[0].clone();
    let converged = wait_for(Duration::from_secs(3), || {
        nodes.iter().all(|n| {
            n.strategy.leader_id().as_ref() == Some(&leader) && n.strategy.members().len() == 3
        })
    })
    .await;
    assert!(converged, "views did not converge");
    let term = nodes[0].strategy.term();
    assert_eq!(term, 1);

    // Cut the leader off from the store
    let old = nodes
        .iter()
        .position(|n| n.strategy.node_id() == &leader)
        .unwrap();
    nodes[old].store.cut();

    // A rival must take over within one lease plus one retry window
    let tuning = nodes[old].strategy.config();
    let failover_bound = tuning.lease_duration() + tuning.failure_timeout();
    let mut max_leaders = 0;
    let failed_over = wait_for(failover_bound, || {
        let current = leaders(&nodes);
        max_leaders = max_leaders.max(current.len());
        current.len() == 1 && current[0] != leader
    })
    .await;
    assert!(
        failed_over,
        "no new leader within {:?} of the old one being cut off",
        failover_bound
    );
    assert!(max_leaders <= 1, "two nodes believed they were leader");

    let new_leader = leaders(&nodes)[0].clone();
    let new_index = nodes
        .iter()
        .position(|n| n.strategy.node_id() == &new_leader)
        .unwrap();
    assert_eq!(nodes[new_index].strategy.leader_term().unwrap(), term + 1);
    assert!(nodes[old].strategy.leader_term().is_err());

    // Survivors eventually drop the silent node from membership
    let dropped = wait_for(Duration::from_secs(3), || {
        nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != old)
            .all(|(_, n)| !n.strategy.members().contains(&leader))
    })
    .await;
    assert!(dropped, "silent node was never declared dead");

    nodes[old].store.restore();
    for node in &nodes {
        assert_ok!(node.strategy.stop().await);
    }

    // The new leader saw its own election at the bumped term
    let events = nodes[new_index].events.lock().unwrap();
    assert!(events.contains(&CoordinationEvent::LeaderChanged {
        leader: Some(new_leader.clone()),
        term: term + 1,
    }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_twice_releases_once() {
    let dir = TempDir::new().unwrap();
    let node = spawn_node(&dir, "solo");
    node.strategy.start().await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || node.strategy.is_leader()).await);
    assert_ok!(node.strategy.stop().await);
    assert_ok!(node.strategy.stop().await);
    assert_eq!(node.store.releases(), 1);

    // Released lease is immediately available to someone else, at a new term
    let other = open_store(&dir.path().join("cluster.db"));
    let outcome = other
        .try_acquire_or_renew_leadership(&NodeId::new("other"), Duration::from_secs(1))
        .await
        .unwrap();
    assert!(matches!(outcome, LeaseOutcome::Acquired { term: 2, .. }));

    // Clean leave removed the heartbeat row
    assert!(other.read_all_heartbeats().await.unwrap().is_empty());

    let events = node.events.lock().unwrap();
    assert_eq!(
        events.last(),
        Some(&CoordinationEvent::LeaderChanged {
            leader: None,
            term: 1
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_after_stop() {
    let dir = TempDir::new().unwrap();
    let node = spawn_node(&dir, "phoenix");

    node.strategy.start().await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || node.strategy.is_leader()).await);
    node.strategy.stop().await.unwrap();
    assert!(!node.strategy.is_leader());

    node.strategy.start().await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || node.strategy.is_leader()).await);
    assert_eq!(node.strategy.leader_term().unwrap(), 2);
    node.strategy.stop().await.unwrap();
}
