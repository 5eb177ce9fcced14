//! Command surface of a running supervisor.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use tracing::error;

use super::SupervisorHandle;
use crate::metadata::DataSourceMetadata;

pub fn supervisor_router(handle: SupervisorHandle) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/suspend", post(suspend))
        .route("/resume", post(resume))
        .route("/reset", post(reset))
        .with_state(Arc::new(handle))
}

async fn status(State(handle): State<Arc<SupervisorHandle>>) -> Response {
    match handle.status().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn suspend(State(handle): State<Arc<SupervisorHandle>>) -> Response {
    match handle.suspend().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn resume(State(handle): State<Arc<SupervisorHandle>>) -> Response {
    match handle.resume_supervision().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn reset(
    State(handle): State<Arc<SupervisorHandle>>,
    metadata: Option<Json<DataSourceMetadata>>,
) -> Response {
    match handle.reset(metadata.map(|Json(m)| m)).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            "Reset was not applied; no stored metadata matched",
        )
            .into_response(),
        Err(e) => {
            error!(?e, "Reset failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
