//! Per-experiment reconciler actors.
//!
//! One tokio task per live experiment, fed from a timer and from the bus.
//! Serializing all reconcile passes for an experiment through its actor
//! removes any need for locks beyond the store's optimistic version: two
//! passes for the same experiment never run concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use phoenix_bus::{DomainEvent, EventBus};
use phoenix_core::Error;

use crate::machine::StateMachine;

/// Nudges queued per actor; overflow coalesces into the pending nudge.
const ACTOR_MAILBOX: usize = 8;

/// Cap for the transient-error backoff inside an actor.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct Supervisor {
    machine: Arc<StateMachine>,
    bus: EventBus,
    reconcile_interval: Duration,
}

impl Supervisor {
    pub fn new(machine: Arc<StateMachine>, bus: EventBus, reconcile_interval: Duration) -> Self {
        Self {
            machine,
            bus,
            reconcile_interval,
        }
    }

    pub async fn run(self) {
        let mut sub = self.bus.subscribe_all();
        let mut actors: HashMap<Uuid, mpsc::Sender<()>> = HashMap::new();
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.reconcile_interval.as_secs(),
            "experiment supervisor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.machine.live_experiments().await {
                        Ok(ids) => {
                            for id in ids {
                                self.nudge(&mut actors, id);
                            }
                        }
                        Err(e) => warn!(error = %e, "supervisor tick failed to list experiments"),
                    }
                    // Actors exit when their experiment goes terminal.
                    actors.retain(|_, tx| !tx.is_closed());
                }
                event = sub.recv() => {
                    let Some(event) = event else { break };
                    if let Some(id) = nudge_worthy(&event) {
                        self.nudge(&mut actors, id);
                    }
                }
            }
        }
    }

    fn nudge(&self, actors: &mut HashMap<Uuid, mpsc::Sender<()>>, id: Uuid) {
        let tx = actors
            .entry(id)
            .or_insert_with(|| spawn_actor(self.machine.clone(), id));
        if tx.is_closed() {
            // Stale handle from a retired actor. Terminal experiments stop
            // appearing in the tick listing, so a nudge here means the
            // experiment still needs one.
            *tx = spawn_actor(self.machine.clone(), id);
        }
        // A full mailbox already carries a pending nudge.
        let _ = tx.try_send(());
    }
}

/// Which bus events warrant an immediate reconcile pass.
///
/// `ExperimentUpdate` is excluded: the machine itself publishes it during
/// a pass, and reacting to it would ping-pong.
fn nudge_worthy(event: &DomainEvent) -> Option<Uuid> {
    match event {
        DomainEvent::TaskStatusChanged { experiment_id, .. } => *experiment_id,
        DomainEvent::KpiUpdate { experiment_id, .. } => Some(*experiment_id),
        _ => None,
    }
}

fn spawn_actor(machine: Arc<StateMachine>, id: Uuid) -> mpsc::Sender<()> {
    let (tx, mut rx) = mpsc::channel(ACTOR_MAILBOX);
    tokio::spawn(async move {
        debug!(experiment_id = %id, "reconciler actor started");
        let mut backoff = Duration::from_millis(500);
        while rx.recv().await.is_some() {
            // Coalesce bursts: one pass covers every queued nudge.
            while rx.try_recv().is_ok() {}

            match machine.reconcile(id).await {
                Ok(phase) if phase.is_terminal() => {
                    debug!(experiment_id = %id, phase = %phase, "reconciler actor retiring");
                    break;
                }
                Ok(_) => {
                    backoff = Duration::from_millis(500);
                }
                Err(e) if e.is_transient() => {
                    // Exponential backoff on the reconciliation tick.
                    warn!(experiment_id = %id, error = %e, backoff_ms = backoff.as_millis() as u64, "transient reconcile failure");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(Error::NotFound(_)) => break,
                Err(e) => {
                    // Precondition/conflict leftovers are already recorded
                    // as events by the machine; nothing to redo here.
                    warn!(experiment_id = %id, error = %e, "reconcile failed");
                }
            }
        }
    });
    tx
}

/// Entry point used by `main`.
pub async fn run_supervisor(
    machine: Arc<StateMachine>,
    bus: EventBus,
    reconcile_interval: Duration,
) {
    Supervisor::new(machine, bus, reconcile_interval).run().await
}

// ── Tests ────────────────────────────────────────────────────────────
