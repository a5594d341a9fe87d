//! Agent-facing endpoints, authenticated by the `X-Agent-Host-ID` header.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use phoenix_core::{AgentRecord, MetricRow, ResourceUsage, TaskStatus};
use phoenix_store::{Store, TaskStatusUpdate};

use crate::poll::{parse_max_wait, poll_task};
use crate::state::AppState;

use super::{bad_request, AgentHost, ApiResult};

// ── Heartbeat ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub host_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    #[serde(default)]
    pub active_tasks: Vec<Uuid>,
    #[serde(default)]
    pub resource_usage: Option<ResourceUsage>,
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    AgentHost(host): AgentHost,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<StatusCode> {
    if req.host_id != host {
        return Err(bad_request(format!(
            "body host_id '{}' does not match X-Agent-Host-ID '{host}'",
            req.host_id
        )));
    }

    let record = AgentRecord {
        host_id: host,
        hostname: req.hostname,
        address: req.address,
        agent_version: req.agent_version,
        declared_status: req.status.unwrap_or_default(),
        capabilities: req.capabilities,
        active_tasks: req.active_tasks,
        resources: req.resource_usage,
        first_seen: Utc::now(), // preserved by the store for known hosts
        last_heartbeat: Utc::now(),
    };
    state.registry.heartbeat(record).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Long poll ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub max_wait: Option<String>,
}

pub async fn poll(
    State(state): State<Arc<AppState>>,
    AgentHost(host): AgentHost,
    Query(query): Query<PollQuery>,
) -> ApiResult<Response> {
    state.registry.touch_poll(&host).await?;

    let max_wait = parse_max_wait(query.max_wait.as_deref(), state.config.agent.poll_timeout());
    match poll_task(&state, &host, max_wait).await? {
        Some(task) => Ok(Json(task).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

// ── Status update ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TaskUpdateRequest {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

pub async fn update_task(
    State(state): State<Arc<AppState>>,
    AgentHost(host): AgentHost,
    Path(id): Path<Uuid>,
    Json(req): Json<TaskUpdateRequest>,
) -> ApiResult<StatusCode> {
    // The claim holder is the only writer.
    let task = state.queue.get(id).await?;
    if task.host_id != "*" && task.host_id != host {
        return Err(bad_request(format!(
            "task {id} belongs to host '{}', not '{host}'",
            task.host_id
        )));
    }

    let update = TaskStatusUpdate {
        status: req.status,
        result: req.result,
        error_message: req.error_message,
    };
    state.queue.update_status(id, &update).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Metric push ──────────────────────────────────────────────────────

pub async fn push_metrics(
    State(state): State<Arc<AppState>>,
    AgentHost(host): AgentHost,
    Json(rows): Json<Vec<MetricRow>>,
) -> ApiResult<StatusCode> {
    if rows.iter().any(|r| r.host_id != host) {
        return Err(bad_request("metric rows must carry the caller's host_id"));
    }
    state.store.insert_metrics(&rows).await?;
    Ok(StatusCode::NO_CONTENT)
}
