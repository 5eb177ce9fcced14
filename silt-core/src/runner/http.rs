//! HTTP surface of a running task, served by the orchestrator's chat
//! endpoint. Handlers delegate to [`RunnerHandle`]; request authorization
//! happens upstream.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::{PauseOutcome, RunnerHandle, SetEndOutcome};
use crate::runner::sequences::OffsetMap;

pub fn task_router(handle: RunnerHandle) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/offsets/current", get(get_current_offsets))
        .route("/offsets/end", get(get_end_offsets).post(set_end_offsets))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .route("/checkpoints", get(get_checkpoints))
        .route("/time/start", get(get_start_time))
        .route("/rowStats", get(get_row_stats))
        .route("/unparseableEvents", get(get_unparseable_events))
        .with_state(Arc::new(handle))
}

async fn get_status(State(handle): State<Arc<RunnerHandle>>) -> impl IntoResponse {
    Json(handle.status())
}

async fn get_current_offsets(State(handle): State<Arc<RunnerHandle>>) -> impl IntoResponse {
    Json(handle.current_offsets())
}

async fn get_end_offsets(State(handle): State<Arc<RunnerHandle>>) -> impl IntoResponse {
    Json(handle.end_offsets())
}

#[derive(Deserialize)]
struct SetEndOffsetsParams {
    #[serde(default = "default_finish")]
    finish: bool,
}

fn default_finish() -> bool {
    true
}

async fn set_end_offsets(
    State(handle): State<Arc<RunnerHandle>>,
    Query(params): Query<SetEndOffsetsParams>,
    Json(offsets): Json<OffsetMap>,
) -> Response {
    match handle.set_end_offsets(offsets, params.finish).await {
        Ok(SetEndOutcome::Ok(offsets)) => (StatusCode::OK, Json(offsets)).into_response(),
        Ok(SetEndOutcome::BadRequest(message)) => {
            (StatusCode::BAD_REQUEST, message).into_response()
        }
        Err(e) => {
            error!(?e, "Unable to set end offsets");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn pause(State(handle): State<Arc<RunnerHandle>>) -> Response {
    match handle.pause().await {
        PauseOutcome::Paused(offsets) => (StatusCode::OK, Json(offsets)).into_response(),
        PauseOutcome::Accepted => (
            StatusCode::ACCEPTED,
            "Request accepted but task has not yet paused",
        )
            .into_response(),
        PauseOutcome::NotPausable(status) => (
            StatusCode::BAD_REQUEST,
            format!("Can't pause, task is not in a pausable state (state: [{status:?}])"),
        )
            .into_response(),
    }
}

async fn resume(State(handle): State<Arc<RunnerHandle>>) -> Response {
    match handle.resume().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            error!(?e, "Unable to resume task");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn stop(State(handle): State<Arc<RunnerHandle>>) -> impl IntoResponse {
    handle.stop_gracefully();
    StatusCode::OK
}

async fn get_checkpoints(
    State(handle): State<Arc<RunnerHandle>>,
) -> Json<BTreeMap<i32, OffsetMap>> {
    Json(handle.checkpoints())
}

async fn get_start_time(State(handle): State<Arc<RunnerHandle>>) -> impl IntoResponse {
    Json(handle.start_time())
}

async fn get_row_stats(State(handle): State<Arc<RunnerHandle>>) -> impl IntoResponse {
    Json(json!({
        "totals": { "buildSegments": handle.row_stats() },
        "movingAverages": {},
    }))
}

async fn get_unparseable_events(State(handle): State<Arc<RunnerHandle>>) -> impl IntoResponse {
    Json(handle.unparseable_events())
}
