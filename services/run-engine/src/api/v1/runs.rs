//! Run inspection and cancellation.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use runway_id::RunId;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::EngineError;
use crate::model::{Run, RunStatus};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/{run_id}", get(get_run))
        .route("/{run_id}/cancel", post(cancel_run))
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RunResponse {
    pub id: String,
    pub task_identifier: String,
    pub queue: String,
    pub machine: String,
    pub status: RunStatus,
    pub is_test: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_on: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Run> for RunResponse {
    fn from(run: Run) -> Self {
        Self {
            id: run.friendly_id(),
            task_identifier: run.task_identifier,
            queue: run.queue_name,
            machine: run.machine_preset,
            status: run.status,
            is_test: run.is_test,
            waiting_on: run.blocking_waitpoint.map(|id| id.to_friendly()),
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

fn parse_run_id(ctx: &RequestContext, raw: &str) -> Result<RunId, ApiError> {
    raw.parse()
        .map_err(|_| ctx.error(EngineError::NotFound { kind: "run", id: raw.to_string() }))
}

/// GET /api/v1/runs/{run_id}
async fn get_run(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&ctx, &run_id)?;
    let run = state
        .engine()
        .get_run(ctx.env_id(), &run_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(RunResponse::from(run)))
}

/// POST /api/v1/runs/{run_id}/cancel
async fn cancel_run(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&ctx, &run_id)?;
    let run = state
        .engine()
        .cancel_run(ctx.env_id(), &run_id)
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(RunResponse::from(run)))
}
