//! HTTP router construction.
//!
//! Assembles routes and middleware into a single `Router`. The user
//! surface sits behind the bearer gate; the agent surface authenticates
//! per-request with `X-Agent-Host-ID`.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;
use crate::{api, ws};

/// Build the complete application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let user_routes = Router::new()
        .route(
            "/experiments",
            get(api::experiments::list).post(api::experiments::create),
        )
        .route("/experiments/{id}", get(api::experiments::get))
        .route("/experiments/{id}/start", post(api::experiments::start))
        .route("/experiments/{id}/stop", post(api::experiments::stop))
        .route("/experiments/{id}/cancel", post(api::experiments::cancel))
        .route("/experiments/{id}/promote", post(api::experiments::promote))
        .route("/experiments/{id}/events", get(api::experiments::events))
        .route("/experiments/{id}/kpis", get(api::experiments::kpis))
        .route(
            "/pipelines/deployments",
            get(api::deployments::list).post(api::deployments::create),
        )
        .route(
            "/pipelines/deployments/{id}",
            put(api::deployments::update).delete(api::deployments::delete),
        )
        .route(
            "/pipelines/deployments/{id}/rollback",
            post(api::deployments::rollback),
        )
        .route(
            "/pipelines/deployments/{id}/versions",
            get(api::deployments::versions),
        )
        .route("/agents", get(api::agents::list))
        .route("/tasks", get(api::status::tasks))
        .route("/status", get(api::status::status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api::require_bearer,
        ));

    let agent_routes = Router::new()
        .route("/agent/heartbeat", post(api::agent::heartbeat))
        .route("/agent/tasks", get(api::agent::poll))
        .route("/agent/tasks/{id}", put(api::agent::update_task))
        .route("/agent/metrics", post(api::agent::push_metrics));

    Router::new()
        .route("/health", get(api::status::health))
        .route("/ws", get(ws::ws_upgrade))
        .nest("/api/v1", user_routes.merge(agent_routes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
