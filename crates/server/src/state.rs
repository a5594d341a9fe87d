//! Shared application state.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use phoenix_bus::EventBus;
use phoenix_core::PhoenixConfig;
use phoenix_engine::StateMachine;
use phoenix_queue::TaskQueue;
use phoenix_registry::AgentRegistry;
use phoenix_store::Store;

pub struct AppState {
    pub config: PhoenixConfig,
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub queue: TaskQueue,
    pub registry: Arc<AgentRegistry>,
    pub machine: Arc<StateMachine>,
    pub ws_metrics: WsMetrics,
    pub started_at: Instant,
}

/// Lock-free counters for WebSocket hub observability.
///
/// All fields use `Ordering::Relaxed`: monotonic counters where eventual
/// visibility is acceptable for status reads.
#[derive(Default)]
pub struct WsMetrics {
    /// Connections accepted since startup.
    pub connections: AtomicU64,
    /// Currently open connections.
    pub open: AtomicU64,
    /// Connections closed because their outbound queue overflowed.
    pub closed_backpressure: AtomicU64,
    /// Frames dropped on overflow (counted before the close).
    pub dropped_frames: AtomicU64,
}

impl AppState {
    pub fn new(config: PhoenixConfig, store: Arc<dyn Store>) -> Arc<Self> {
        let bus = EventBus::new();
        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            bus.clone(),
            config.agent.heartbeat_interval(),
        ));
        // The registry gates dispatch: non-healthy hosts keep their queued
        // tasks deferred in pending.
        let queue = TaskQueue::new(store.clone(), bus.clone()).with_gate(registry.clone());
        let machine = Arc::new(StateMachine::new(
            store.clone(),
            queue.clone(),
            bus.clone(),
            config.experiment.clone(),
        ));
        Arc::new(Self {
            config,
            store,
            bus,
            queue,
            registry,
            machine,
            ws_metrics: WsMetrics::default(),
            started_at: Instant::now(),
        })
    }
}
