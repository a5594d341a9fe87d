//! Liveness and component status.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use phoenix_core::{Task, TaskStatus};
use phoenix_store::{Store, TaskFilter};

use crate::state::AppState;

use super::ApiResult;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Component summary: store kind, fleet tiers, experiment phases, queue
/// depth, event-bus and WebSocket drop counters.
pub async fn status(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let experiments = state.store.list_experiments(None).await?;
    let mut by_phase = std::collections::HashMap::new();
    for exp in &experiments {
        *by_phase.entry(exp.phase.as_str()).or_insert(0u64) += 1;
    }

    let pending = state
        .queue
        .list(&TaskFilter {
            status: Some(TaskStatus::Pending),
            ..Default::default()
        })
        .await?
        .len();

    let tiers: std::collections::HashMap<String, usize> = state
        .registry
        .tier_counts()
        .into_iter()
        .map(|(tier, n)| (tier.to_string(), n))
        .collect();

    Ok(Json(serde_json::json!({
        "store": if state.config.postgres.is_configured() { "postgres" } else { "memory" },
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "experiments": by_phase,
        "agents": tiers,
        "queue": {"pending": pending},
        "bus": {"dropped_events": state.bus.dropped_total()},
        "websocket": {
            "open": state.ws_metrics.open.load(Ordering::Relaxed),
            "connections_total": state.ws_metrics.connections.load(Ordering::Relaxed),
            "closed_backpressure": state.ws_metrics.closed_backpressure.load(Ordering::Relaxed),
            "dropped_frames": state.ws_metrics.dropped_frames.load(Ordering::Relaxed),
        },
    })))
}

// ── Operator task view ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TasksQuery {
    pub experiment_id: Option<Uuid>,
    pub host_id: Option<String>,
    pub status: Option<TaskStatus>,
}

pub async fn tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TasksQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(
        state
            .queue
            .list(&TaskFilter {
                experiment_id: query.experiment_id,
                host_id: query.host_id,
                status: query.status,
            })
            .await?,
    ))
}
