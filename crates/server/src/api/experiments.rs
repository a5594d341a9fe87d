//! Experiment CRUD and control verbs.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use phoenix_core::{EventRecord, Experiment, ExperimentConfig, KpiResult, Phase, Variant};
use phoenix_store::Store;

use crate::state::AppState;

use super::ApiResult;

#[derive(Debug, Deserialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub config: ExperimentConfig,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub phase: Option<Phase>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub variant: Variant,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Experiment>>> {
    Ok(Json(state.store.list_experiments(query.phase).await?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateExperimentRequest>,
) -> ApiResult<(StatusCode, Json<Experiment>)> {
    let exp = state
        .machine
        .create(req.name, req.description, req.config)
        .await?;
    Ok((StatusCode::CREATED, Json(exp)))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Experiment>> {
    Ok(Json(state.store.get_experiment(id).await?))
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Experiment>> {
    Ok(Json(state.machine.start(id).await?))
}

pub async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Experiment>> {
    Ok(Json(state.machine.stop(id).await?))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Experiment>> {
    Ok(Json(state.machine.cancel(id).await?))
}

pub async fn promote(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PromoteRequest>,
) -> ApiResult<Json<Experiment>> {
    Ok(Json(state.machine.promote(id, req.variant).await?))
}

/// Durable event log (audit view and WebSocket topic history).
pub async fn events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<EventRecord>>> {
    // 404 for unknown experiments rather than an empty log.
    state.store.get_experiment(id).await?;
    let limit = query.limit.unwrap_or(100);
    Ok(Json(state.store.list_events(id, limit).await?))
}

pub async fn kpis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<KpiResult>>> {
    state.store.get_experiment(id).await?;
    let limit = query.limit.unwrap_or(50);
    Ok(Json(state.store.list_kpi_results(id, limit).await?))
}
