//! Background loops: claim recovery, liveness sweeping, reconciliation,
//! KPI evaluation, metric-cache retention. All are daemonized tokio tasks
//! that die with the process; shutdown drains in-flight HTTP work only.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use phoenix_engine::{KpiEvaluator, MetricsBackend, PromBackend};
use phoenix_store::Store;

use crate::state::AppState;

/// Spawn every background loop. Call once after the state is built.
pub fn spawn_all(state: &Arc<AppState>) {
    // Expired-claim recovery.
    tokio::spawn(phoenix_queue::run_recovery_loop(
        state.queue.clone(),
        state.config.task.claim_lease(),
        state.config.task.max_retries,
    ));

    // Agent liveness sweeper.
    tokio::spawn(phoenix_registry::run_sweeper(state.registry.clone()));

    // Per-experiment reconciler actors.
    tokio::spawn(phoenix_engine::run_supervisor(
        state.machine.clone(),
        state.bus.clone(),
        state.config.experiment.reconcile_interval(),
    ));

    // KPI evaluation against the metrics backend.
    match PromBackend::new(state.config.kpi.metrics_url.clone()) {
        Ok(backend) => {
            let backend: Arc<dyn MetricsBackend> = Arc::new(backend);
            let evaluator = Arc::new(KpiEvaluator::new(
                state.store.clone(),
                state.bus.clone(),
                state.machine.clone(),
                backend,
                state.config.kpi.clone(),
            ));
            tokio::spawn(phoenix_engine::run_evaluator(evaluator));
        }
        Err(e) => warn!(error = %e, "kpi evaluator disabled: metrics backend init failed"),
    }

    // Metric-cache retention sweep, hourly.
    let retention_state = state.clone();
    tokio::spawn(async move {
        let retention = retention_state.config.metric_cache.retention();
        let period = std::time::Duration::from_secs(3600);
        info!(
            retention_days = retention_state.config.metric_cache.retention_days,
            "metric retention sweep started"
        );
        loop {
            tokio::time::sleep(period).await;
            let cutoff = Utc::now()
                - chrono::TimeDelta::from_std(retention).unwrap_or(chrono::TimeDelta::days(7));
            match retention_state.store.prune_metrics(cutoff).await {
                Ok(0) => {}
                Ok(n) => info!(rows = n, "pruned metric cache"),
                Err(e) => warn!(error = %e, "metric cache prune failed"),
            }
        }
    });
}
