//! Task API Handlers
//!
//! Request/response endpoints of the step lifecycle. The streaming
//! endpoints live in [`super::stream`].

use axum::{Json, extract::State, extract::rejection::JsonRejection};
use stratum_core::dto::task::{
    RunTaskRequest, RunTaskResponse, TaskAbortRequest, TaskAbortResponse, TaskStepQuery,
};

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /task/run
/// Start a job step in a new container
pub async fn run_task(
    State(state): State<AppState>,
    payload: Result<Json<RunTaskRequest>, JsonRejection>,
) -> ApiResult<Json<RunTaskResponse>> {
    let Json(req) = payload?;
    tracing::info!(
        task_id = %req.task_id,
        step = req.step,
        "Run task request"
    );

    let container_id = state.runner.start(req).await?;
    Ok(Json(RunTaskResponse { container_id }))
}

/// POST /task/abort
/// Abort the latest step of a task, or check whether it could be aborted
pub async fn abort_task(
    State(state): State<AppState>,
    payload: Result<Json<TaskAbortRequest>, JsonRejection>,
) -> ApiResult<Json<TaskAbortResponse>> {
    let Json(req) = payload?;
    tracing::info!(
        task_id = %req.task_id,
        just_check = req.just_check,
        "Abort task request"
    );

    let resp = state.runner.abort(&req).await?;
    Ok(Json(resp))
}

/// POST /task/pause
pub async fn pause_task(
    State(state): State<AppState>,
    payload: Result<Json<TaskStepQuery>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(query) = payload?;
    tracing::debug!(task_id = %query.task_id, step = query.step, "Pause task");

    state.runner.pause(&query).await?;
    Ok(Json(serde_json::json!({})))
}

/// POST /task/unpause
pub async fn unpause_task(
    State(state): State<AppState>,
    payload: Result<Json<TaskStepQuery>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(query) = payload?;
    tracing::debug!(task_id = %query.task_id, step = query.step, "Unpause task");

    state.runner.unpause(&query).await?;
    Ok(Json(serde_json::json!({})))
}
