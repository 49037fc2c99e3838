//! Per-process coordination state shared by the two engines

use crate::common::NodeId;
use crate::coordinator::election::Role;
use crate::coordinator::events::{CoordinationEvent, EventSender};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Local view of the cluster. Every transition and the event announcing it
/// happen under the same lock, which is what orders event delivery.
#[derive(Default)]
pub struct SharedState {
    pub role: Role,
    pub leader: Option<NodeId>,
    /// Highest term observed
    pub term: i64,
    pub members: BTreeSet<NodeId>,
    /// node -> store-stamped time of its last heartbeat
    pub snapshot: HashMap<NodeId, i64>,
    events: Option<EventSender>,
}

impl SharedState {
    pub fn emit(&self, event: CoordinationEvent) {
        match &self.events {
            Some(tx) => tx.send(event),
            None => tracing::debug!("No dispatcher running, dropping {:?}", event),
        }
    }

    pub fn attach(&mut self, events: EventSender) {
        self.events = Some(events);
    }

    /// Drop the sender so the dispatcher can drain and exit
    pub fn detach(&mut self) {
        self.events = None;
    }
}

pub type SharedHandle = Arc<Mutex<SharedState>>;

pub fn lock(state: &SharedHandle) -> MutexGuard<'_, SharedState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
