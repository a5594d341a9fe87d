//! REST surface. Handlers are thin: parse and validate input, call into
//! the state machine / queue / registry, write the response. The error
//! envelope `{error: {code, message}}` and its status mapping are stable
//! across API versions.

pub mod agent;
pub mod agents;
pub mod deployments;
pub mod experiments;
pub mod status;

use std::sync::Arc;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use phoenix_core::Error;

use crate::state::AppState;

// ── Error envelope ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// Domain error carried out to the HTTP layer.
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: self.0.code(),
                message: self.0.to_string(),
                details: None,
            },
        });
        let mut response = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

pub(crate) fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(Error::Validation(msg.into()))
}

// ── Agent authentication ─────────────────────────────────────────────

/// Stable host id from the `X-Agent-Host-ID` header; required on every
/// agent-surface endpoint.
pub struct AgentHost(pub String);

impl<S: Send + Sync> FromRequestParts<S> for AgentHost {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let host = parts
            .headers
            .get("x-agent-host-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| bad_request("missing X-Agent-Host-ID header"))?;
        Ok(AgentHost(host.to_string()))
    }
}

// ── User authentication ──────────────────────────────────────────────

/// Bearer-token gate for the user surface. A no-op until
/// `PHOENIX_API_TOKEN` is configured.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.server.api_token {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            let body = Json(ErrorBody {
                error: ErrorDetail {
                    code: "unauthorized",
                    message: "missing or invalid bearer token".into(),
                    details: None,
                },
            });
            return (StatusCode::UNAUTHORIZED, body).into_response();
        }
    }
    next.run(request).await
}

// ── Tests ────────────────────────────────────────────────────────────
