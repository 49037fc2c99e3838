//! Coordination events and their ordered delivery

use crate::common::NodeId;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A locally observed change in leadership or membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    /// `leader` is `None` when this node stepped down without a known successor
    LeaderChanged { leader: Option<NodeId>, term: i64 },
    MemberJoined { node_id: NodeId },
    MemberLeft { node_id: NodeId },
    /// This node could not write its heartbeat; peers may consider it dead
    SelfDegraded { consecutive_failures: u32 },
    SelfRecovered,
}

pub type EventHandler = Arc<dyn Fn(&CoordinationEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Producer side handed to the engines
#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<CoordinationEvent>);

impl EventSender {
    pub fn send(&self, event: CoordinationEvent) {
        if let Err(e) = self.0.send(event) {
            tracing::debug!("Dropping event, dispatcher gone: {:?}", e.0);
        }
    }
}

/// Subscriber registry. Events from one dispatcher reach every handler in
/// the order they were sent.
#[derive(Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<(SubscriptionId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CoordinationEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Subscribe with a channel instead of a callback
    pub fn channel(&self) -> mpsc::UnboundedReceiver<CoordinationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Start delivering events. The task ends once every sender is dropped
    /// and the queue is drained. A panicking handler does not stop delivery.
    pub fn spawn_dispatcher(&self) -> (EventSender, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<CoordinationEvent>();
        let handlers = self.handlers.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::debug!("Dispatching {:?}", event);
                let current: Vec<EventHandler> = handlers
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect();
                for handler in current {
                    let delivered = panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
                    if delivered.is_err() {
                        tracing::error!("Event handler panicked while handling {:?}", event);
                    }
                }
            }
        });

        (EventSender(tx), task)
    }
}
