//! In-process publish/subscribe for domain events.
//!
//! Topics are keyed by entity (`exp.<id>`, `metrics.<id>`) or class
//! (`agents`, `tasks`). Each subscription is a bounded buffer (default 256)
//! with a drop-oldest policy; drops are counted per subscription and in a
//! bus-wide gauge. Publish never blocks. Events are ephemeral; durable
//! history lives in the experiment event table.

mod event;

pub use event::DomainEvent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use uuid::Uuid;

/// Default per-subscription buffer capacity.
pub const DEFAULT_CAPACITY: usize = 256;

// ── Topics ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Lifecycle events for one experiment.
    Experiment(Uuid),
    /// KPI updates for one experiment.
    Metrics(Uuid),
    /// Fleet liveness changes.
    Agents,
    /// Task enqueues and status changes (the dispatcher's wake source).
    Tasks,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Experiment(id) => write!(f, "experiment:{id}"),
            Topic::Metrics(id) => write!(f, "metrics:{id}"),
            Topic::Agents => f.write_str("agents"),
            Topic::Tasks => f.write_str("tasks"),
        }
    }
}

impl Topic {
    /// Parse a WebSocket subscription string (`experiment:<id>`,
    /// `metrics:<id>`, `agents`, `tasks`).
    pub fn parse(s: &str) -> Option<Topic> {
        match s {
            "agents" => return Some(Topic::Agents),
            "tasks" => return Some(Topic::Tasks),
            _ => {}
        }
        if let Some(id) = s.strip_prefix("experiment:") {
            return Uuid::parse_str(id).ok().map(Topic::Experiment);
        }
        if let Some(id) = s.strip_prefix("metrics:") {
            return Uuid::parse_str(id).ok().map(Topic::Metrics);
        }
        None
    }
}

// ── Bus ──────────────────────────────────────────────────────────────

struct BusInner {
    topics: RwLock<HashMap<Topic, broadcast::Sender<DomainEvent>>>,
    /// Firehose tap used by the WebSocket hub and the reconciler router.
    global: broadcast::Sender<DomainEvent>,
    dropped: AtomicU64,
    capacity: usize,
}

/// Cheap-to-clone handle; all clones share the same channels.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (global, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                global,
                dropped: AtomicU64::new(0),
                capacity,
            }),
        }
    }

    /// Publish to a topic (and the global tap). Never blocks; events for
    /// topics nobody subscribes to are discarded.
    pub fn publish(&self, topic: Topic, event: DomainEvent) {
        let _ = self.inner.global.send(event.clone());

        let mut topics = match self.inner.topics.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(tx) = topics.get(&topic) {
            if tx.receiver_count() == 0 {
                // Last subscriber left; reclaim the channel.
                topics.remove(&topic);
            } else {
                let _ = tx.send(event);
            }
        }
    }

    /// Subscribe to one topic. Events published before this call are not seen.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let mut topics = match self.inner.topics.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let tx = topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0);
        Subscription {
            rx: tx.subscribe(),
            bus: self.inner.clone(),
            dropped: 0,
        }
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: self.inner.global.subscribe(),
            bus: self.inner.clone(),
            dropped: 0,
        }
    }

    /// Total events dropped across all subscriptions since startup.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

// ── Subscription ─────────────────────────────────────────────────────

/// One bounded subscription. A slow consumer loses the oldest events and
/// the loss is counted; `recv` then resumes from the oldest retained event.
pub struct Subscription {
    rx: broadcast::Receiver<DomainEvent>,
    bus: Arc<BusInner>,
    dropped: u64,
}

impl Subscription {
    /// Receive the next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    self.bus.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and the hub's drain paths.
    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                    self.bus.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }

    /// Events this subscription lost to back-pressure.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ── Tests ────────────────────────────────────────────────────────────
