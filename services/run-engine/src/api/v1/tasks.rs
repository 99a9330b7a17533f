//! Task trigger endpoint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use runway_id::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::EngineError;
use crate::model::{ParentRun, RunSpec, RunStatus};
use crate::payload::IoPacket;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{task_identifier}/trigger", post(trigger_task))
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerTaskRequest {
    pub payload: Option<Value>,
    #[serde(default)]
    pub options: TriggerOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerOptions {
    /// Defaults to `task/{task_identifier}`.
    pub queue: Option<String>,
    pub machine: Option<String>,
    pub priority: Option<i32>,
    #[serde(default)]
    pub test: bool,
    /// Caller-chosen run id, making retries of the same trigger idempotent.
    pub run_id: Option<RunId>,
    pub parent_run_id: Option<RunId>,
    #[serde(default)]
    pub resume_parent_on_completion: bool,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct TriggerTaskResponse {
    pub id: String,
    pub status: RunStatus,
}

/// POST /api/v1/tasks/{task_identifier}/trigger
async fn trigger_task(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(task_identifier): Path<String>,
    Json(req): Json<TriggerTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let payload =
        IoPacket::from_json(req.payload.as_ref()).map_err(|e| ctx.error(EngineError::from(e)))?;
    let options = req.options;

    let spec = RunSpec {
        friendly_id: options.run_id.unwrap_or_default(),
        env_id: *ctx.env_id(),
        queue_name: options
            .queue
            .unwrap_or_else(|| format!("task/{task_identifier}")),
        task_identifier,
        payload,
        master_queue: state.master_queue().to_string(),
        machine: options.machine,
        priority: options.priority,
        is_test: options.test,
        parent: options.parent_run_id.map(|run_id| ParentRun {
            run_id,
            resume_on_completion: options.resume_parent_on_completion,
        }),
    };

    let run = state
        .engine()
        .trigger(spec)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok((
        StatusCode::OK,
        Json(TriggerTaskResponse {
            id: run.friendly_id(),
            status: run.status,
        }),
    ))
}
