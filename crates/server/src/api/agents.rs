//! Fleet view.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use phoenix_registry::AgentView;

use crate::state::AppState;

use super::ApiResult;

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<AgentView>>> {
    Ok(Json(state.registry.list().await?))
}
