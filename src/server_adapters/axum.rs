//! Axum router for the run driver
//!
//! | Method | Path                      | Response                          |
//! |--------|---------------------------|-----------------------------------|
//! | POST   | `/runs`                   | `text/event-stream` frame stream  |
//! | POST   | `/runs/{run_id}/cancel`   | `{"cancelled": bool}`             |
//! | POST   | `/runs/cancel`            | `{"cancelled": n}`                |
//! | GET    | `/runs`                   | `{"runs": [...]}`                 |
//!
//! Every route requires `Authorization: Bearer <token>`, decoded with the
//! driver's identity decoder. Cancel and list routes only see the caller's
//! own runs; a run of another caller is reported as not found.
//!
//! Errors are `{"success": false, "error": ..., "code": ...}`.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, info};

use crate::driver::RunDriver;
use crate::error::StreamError;
use crate::identity::Identity;
use crate::registry::RunId;
use crate::server_adapters::{
    CancelOwnerResponse, CancelResponse, RUN_ID_HEADER, RunPayload, RunsResponse, bearer_token,
    frame_stream,
};

/// Shared router state.
#[derive(Debug, Clone)]
pub struct AppState {
    driver: Arc<RunDriver>,
}

impl AppState {
    /// Wrap a driver.
    pub fn new(driver: Arc<RunDriver>) -> Self {
        Self { driver }
    }

    /// The driver behind the routes.
    pub fn driver(&self) -> &Arc<RunDriver> {
        &self.driver
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(start_run).get(list_runs))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/runs/cancel", post(cancel_own_runs))
        .with_state(state)
}

/// HTTP error with a JSON body.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// HTTP status
    #[serde(skip)]
    pub status: StatusCode,
    /// Error message
    pub message: String,
    /// Machine-readable code
    pub code: &'static str,
}

impl ApiError {
    /// Create an error.
    pub fn new(status: StatusCode, message: impl Into<String>, code: &'static str) -> Self {
        Self {
            status,
            message: message.into(),
            code,
        }
    }

    /// 401 Unauthorized
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message, "UNAUTHORIZED")
    }

    /// 500 Internal Server Error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, "INTERNAL_ERROR")
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Auth(_) => Self::unauthorized(err.user_message()),
            StreamError::DuplicateRun(_) => {
                Self::new(StatusCode::CONFLICT, err.user_message(), "DUPLICATE_RUN")
            }
            other => Self::internal(other.user_message()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.message,
            "code": self.code,
        }));
        (self.status, body).into_response()
    }
}

fn credential(headers: &HeaderMap) -> Result<SecretString, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))
}

async fn caller(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let token = credential(headers)?;
    Ok(state.driver.authenticate(&token).await?)
}

async fn start_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RunPayload>,
) -> Result<Response, ApiError> {
    let token = credential(&headers)?;

    let (run_id, rx) = state.driver.spawn(payload.into_request(token)).await?;
    info!(run_id = %run_id, "run stream opened");

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    let id_value = HeaderValue::from_str(run_id.as_str())
        .map_err(|e| ApiError::internal(format!("invalid run id header: {e}")))?;
    response_headers.insert(RUN_ID_HEADER, id_value);

    Ok((response_headers, Body::from_stream(frame_stream(rx))).into_response())
}

async fn cancel_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(run_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let identity = caller(&state, &headers).await?;
    let cancelled = state
        .driver
        .cancel_owned(&RunId::from(run_id), &identity.id);
    debug!(owner = %identity.id, cancelled, "cancel requested");
    Ok(Json(CancelResponse { cancelled }))
}

async fn cancel_own_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CancelOwnerResponse>, ApiError> {
    let identity = caller(&state, &headers).await?;
    let cancelled = state.driver.cancel_owner(&identity.id);
    debug!(owner = %identity.id, cancelled, "owner cancel requested");
    Ok(Json(CancelOwnerResponse { cancelled }))
}

async fn list_runs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RunsResponse>, ApiError> {
    let identity = caller(&state, &headers).await?;
    let runs = state
        .driver
        .registry()
        .snapshot()
        .into_iter()
        .filter(|run| run.owner == identity.id)
        .collect();
    Ok(Json(RunsResponse { runs }))
}
