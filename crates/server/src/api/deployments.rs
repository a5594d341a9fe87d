//! Standalone pipeline deployments: deploys made outside any experiment.
//!
//! Each POST/PUT creates a deployment record and enqueues the matching
//! `deploy_pipeline` task; history rows are soft-deleted records, which is
//! what `versions` and `rollback` walk.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use phoenix_core::{ActivePipeline, DeployPipelinePayload, Error, Task, Variant};
use phoenix_store::Store;

use crate::state::AppState;

use super::ApiResult;

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub host_id: String,
    pub pipeline_url: String,
    #[serde(default = "default_variant")]
    pub variant: Variant,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

fn default_variant() -> Variant {
    Variant::Candidate
}

#[derive(Debug, Deserialize)]
pub struct UpdateDeploymentRequest {
    #[serde(default)]
    pub pipeline_url: Option<String>,
    #[serde(default)]
    pub variables: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub host_id: Option<String>,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<ActivePipeline>>> {
    Ok(Json(
        state
            .store
            .list_active_pipelines(query.host_id.as_deref())
            .await?,
    ))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDeploymentRequest>,
) -> ApiResult<(StatusCode, Json<ActivePipeline>)> {
    let deployment = deploy(
        &state,
        req.host_id,
        req.variant,
        req.pipeline_url,
        req.variables,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

/// Replace a live deployment: stop the old record, deploy the new config.
pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateDeploymentRequest>,
) -> ApiResult<Json<ActivePipeline>> {
    let current = state.store.get_active_pipeline(id).await?;
    if !current.is_live() {
        return Err(Error::Precondition(format!("deployment {id} is stopped")).into());
    }

    state.store.stop_active_pipeline(id).await?;
    let deployment = deploy(
        &state,
        current.host_id,
        current.variant,
        req.pipeline_url.unwrap_or(current.pipeline_url),
        req.variables.unwrap_or(current.variables),
    )
    .await?;
    Ok(Json(deployment))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let current = state.store.get_active_pipeline(id).await?;
    state.store.stop_active_pipeline(id).await?;
    state
        .queue
        .enqueue(Task::stop_pipeline(
            current.host_id,
            current.experiment_id,
            Some(current.variant),
        ))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Redeploy the most recent previously-stopped config for this host.
pub async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ActivePipeline>> {
    let current = state.store.get_active_pipeline(id).await?;
    let history = state.store.list_pipeline_history(&current.host_id).await?;
    let previous = history
        .into_iter()
        .filter(|p| p.id != current.id && p.stopped_at.is_some())
        .max_by_key(|p| p.deployed_at)
        .ok_or_else(|| {
            Error::Precondition(format!(
                "no previous deployment to roll back to on host {}",
                current.host_id
            ))
        })?;

    if current.is_live() {
        state.store.stop_active_pipeline(current.id).await?;
    }
    let deployment = deploy(
        &state,
        previous.host_id,
        previous.variant,
        previous.pipeline_url,
        previous.variables,
    )
    .await?;
    Ok(Json(deployment))
}

/// Full deployment history for the host this deployment lives on.
pub async fn versions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<ActivePipeline>>> {
    let current = state.store.get_active_pipeline(id).await?;
    Ok(Json(
        state.store.list_pipeline_history(&current.host_id).await?,
    ))
}

/// Record the deployment and enqueue the agent-side work.
async fn deploy(
    state: &AppState,
    host_id: String,
    variant: Variant,
    pipeline_url: String,
    variables: HashMap<String, String>,
) -> ApiResult<ActivePipeline> {
    let payload = DeployPipelinePayload {
        pipeline_url: pipeline_url.clone(),
        variant,
        variables: variables.clone(),
        pushgateway_url: None,
    };
    let task = Task::new(
        host_id.clone(),
        None,
        phoenix_core::TaskAction::Deploy,
        phoenix_core::PRIORITY_DEPLOY,
        &phoenix_core::TaskPayload::DeployPipeline(payload),
    );
    let config_hash = {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        serde_json::to_string(&task.config)
            .unwrap_or_default()
            .hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    };

    let deployment = ActivePipeline::new(
        host_id,
        None,
        variant,
        pipeline_url,
        config_hash,
        variables,
    );
    let deployment = state.store.insert_active_pipeline(&deployment).await?;
    state.queue.enqueue(task).await?;
    Ok(deployment)
}
