//! Request handlers for the HTTP API.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::ApiState;
use crate::{AppError, Result};

fn default_user_id() -> String {
    "demo_user".into()
}

/// Body of `POST /api/agent/start`.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    /// Task text to plan and execute.
    pub task: String,
    /// User whose context is loaded.
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

/// Body of `POST /api/checkpoints`.
#[derive(Debug, Deserialize)]
pub struct CheckpointRequest {
    /// Session to checkpoint.
    pub session_id: String,
}

/// Query of `GET /api/checkpoints`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Maximum number of records.
    pub limit: Option<u32>,
}

/// Body of `POST /api/restore`.
#[derive(Debug, Default, Deserialize)]
pub struct RestoreRequest {
    /// Checkpoint to restore; the newest one when absent.
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

/// Body of `POST /api/simulate-crash`.
#[derive(Debug, Deserialize)]
pub struct CrashRequest {
    /// Session to crash.
    pub session_id: String,
    /// Wait this long before crashing.
    #[serde(default)]
    pub delay_seconds: f64,
}

pub(super) async fn health() -> &'static str {
    "ok"
}

pub(super) async fn start(
    State(state): State<ApiState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<Value>> {
    let session_id = state
        .orchestrator
        .start(&request.task, &request.user_id)
        .await?;
    Ok(Json(json!({ "session_id": session_id, "status": "started" })))
}

pub(super) async fn status(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    let session = state.orchestrator.get_status(&session_id).await?;
    Ok(Json(serde_json::to_value(session)?))
}

pub(super) async fn sessions(State(state): State<ApiState>) -> Result<Json<Value>> {
    let sessions = state.orchestrator.list().await?;
    Ok(Json(json!({ "sessions": sessions })))
}

pub(super) async fn delete_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>> {
    if state.orchestrator.delete_session(&session_id).await? {
        Ok(Json(json!({ "deleted": true })))
    } else {
        Err(AppError::NotFound(format!("session {session_id} not found")))
    }
}

pub(super) async fn create_checkpoint(
    State(state): State<ApiState>,
    Json(request): Json<CheckpointRequest>,
) -> Result<(StatusCode, Json<Value>)> {
    let checkpoint = state
        .orchestrator
        .create_checkpoint(&request.session_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "checkpoint": checkpoint })),
    ))
}

pub(super) async fn list_checkpoints(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>> {
    let limit = query.limit.unwrap_or(state.default_list_limit);
    let checkpoints = state.orchestrator.list_checkpoints(limit).await?;
    Ok(Json(json!({ "checkpoints": checkpoints })))
}

pub(super) async fn get_checkpoint(
    State(state): State<ApiState>,
    Path(checkpoint_id): Path<String>,
) -> Result<Json<Value>> {
    let checkpoint = state.orchestrator.get_checkpoint(&checkpoint_id).await?;
    Ok(Json(json!({ "checkpoint": checkpoint })))
}

pub(super) async fn delete_checkpoint(
    State(state): State<ApiState>,
    Path(checkpoint_id): Path<String>,
) -> Result<Json<Value>> {
    if state.orchestrator.delete_checkpoint(&checkpoint_id).await? {
        Ok(Json(json!({ "deleted": true })))
    } else {
        Err(AppError::NotFound(format!(
            "checkpoint {checkpoint_id} not found"
        )))
    }
}

pub(super) async fn restore(
    State(state): State<ApiState>,
    body: Option<Json<RestoreRequest>>,
) -> Result<Json<Value>> {
    let Json(request) = body.unwrap_or_default();
    let outcome = state
        .orchestrator
        .restore(request.checkpoint_id.as_deref())
        .await?;
    Ok(Json(json!({
        "success": true,
        "resumed": outcome.resumed,
        "session_id": outcome.session_id,
        "checkpoint_id": outcome.checkpoint_id,
        "resumed_step_number": outcome.resumed_step_number,
        "total_steps": outcome.total_steps,
        "status": outcome.state.status,
    })))
}

pub(super) async fn simulate_crash(
    State(state): State<ApiState>,
    Json(request): Json<CrashRequest>,
) -> Result<Json<Value>> {
    if request.delay_seconds > 0.0 {
        let delay = Duration::try_from_secs_f64(request.delay_seconds).map_err(|err| {
            AppError::Validation(format!("invalid delay_seconds: {err}"))
        })?;
        tokio::time::sleep(delay).await;
    }
    let session = state.orchestrator.simulate_crash(&request.session_id).await?;
    Ok(Json(json!({
        "crashed": true,
        "session_id": session.session_id,
        "current_step_index": session.current_step_index,
        "total_steps": session.total_steps,
    })))
}

pub(super) async fn demo_status(State(state): State<ApiState>) -> Result<Json<Value>> {
    let status = state.orchestrator.demo_status().await?;
    Ok(Json(serde_json::to_value(status)?))
}
