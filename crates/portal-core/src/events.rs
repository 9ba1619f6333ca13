//! Event bus.
//!
//! Topic-less fan-out of structured events to any number of subscribers.
//! Each subscriber owns a bounded inbox; a slow subscriber loses its oldest
//! pending events (and sees a single `overflow` marker) without ever
//! blocking producers or affecting other subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Per-subscriber inbox capacity.
const INBOX_CAPACITY: usize = 256;

/// Interval between heartbeat events.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InitialStatus,
    StatusUpdate,
    ServerEvent,
    ToolExecution,
    ResourceAccess,
    ServerReconnection,
    MetricsUpdate,
    Heartbeat,
    Overflow,
}

/// One event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    fn overflow_marker() -> Self {
        Self::new(
            EventKind::Overflow,
            serde_json::json!({ "message": "subscriber inbox overflowed, oldest events dropped" }),
        )
    }
}

struct Inbox {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    overflowed: AtomicBool,
    closed: AtomicBool,
}

impl Inbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(INBOX_CAPACITY)),
            notify: Notify::new(),
            overflowed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: Event) {
        {
            let mut queue = self.queue.lock().expect("inbox poisoned");
            if queue.len() == INBOX_CAPACITY {
                queue.pop_front();
                self.overflowed.store(true, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Receiving half of one bus subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    inbox: Arc<Inbox>,
    bus: EventBus,
}

impl Subscription {
    /// Next event, in publication order for this subscriber.
    ///
    /// After an overflow the first delivery is a single `overflow` marker,
    /// then the surviving events. Returns `None` once the bus is gone and
    /// the inbox drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                if self.inbox.overflowed.swap(false, Ordering::Relaxed) {
                    return Some(Event::overflow_marker());
                }
                let mut queue = self.inbox.queue.lock().expect("inbox poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.inbox.closed.load(Ordering::Relaxed) {
                return None;
            }
            self.inbox.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

/// Fan-out bus. Cheap to clone; all clones share the subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<(Uuid, Arc<Inbox>)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber with a fresh bounded inbox.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let inbox = Arc::new(Inbox::new());
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push((id, inbox.clone()));
        debug!(subscriber = %id, total = self.subscriber_count(), "subscriber added");
        Subscription {
            id,
            inbox,
            bus: self.clone(),
        }
    }

    fn unsubscribe(&self, id: Uuid) {
        let mut subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        subscribers.retain(|(sid, _)| *sid != id);
        debug!(subscriber = %id, total = subscribers.len(), "subscriber removed");
    }

    /// Deliver an event to every subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock().expect("subscriber list poisoned");
        for (_, inbox) in subscribers.iter() {
            inbox.push(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber list poisoned").len()
    }

    /// Spawn the heartbeat task so idle SSE clients keep their connections
    /// warm and can detect breakage.
    pub fn start_heartbeat(&self) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so subscribers see
            // their initial snapshot before any heartbeat.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                bus.publish(Event::new(
                    EventKind::Heartbeat,
                    serde_json::json!({ "message": "ping" }),
                ));
            }
        })
    }
}
