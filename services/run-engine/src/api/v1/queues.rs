//! Queue introspection.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/length", get(queue_length))
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct QueueLengthResponse {
    pub length: usize,
}

/// GET /api/v1/queues/length
///
/// Pending runs in the caller's environment queue.
async fn queue_length(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let length = state
        .engine()
        .length_of_env_queue(ctx.env_id())
        .await
        .map_err(|e| ctx.error(e))?;
    Ok(Json(QueueLengthResponse { length }))
}
