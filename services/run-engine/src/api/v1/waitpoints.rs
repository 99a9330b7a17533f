//! Waitpoint token endpoints.
//!
//! Tokens are `MANUAL_TOKEN` waitpoints: created by one party, completed by
//! whoever holds the id.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use runway_id::WaitpointId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::EngineError;
use crate::model::WaitpointKind;
use crate::payload::IoPacket;
use crate::state::AppState;
use crate::waitpoints::CreateWaitpointOptions;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_token))
        .route("/{waitpoint_friendly_id}/complete", post(complete_token))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateTokenRequest {
    /// Reusing a key in the same environment returns the existing token.
    pub idempotency_key: Option<String>,
    /// Instant after which the token is considered timed out.
    pub timeout: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct CreateTokenResponse {
    pub id: String,
    pub is_cached: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteTokenRequest {
    pub data: Option<Value>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct CompleteTokenResponse {
    pub success: bool,
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /api/v1/waitpoints/tokens
async fn create_token(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.idempotency_key.as_deref().is_some_and(str::is_empty) {
        return Err(ctx.error(ApiError::bad_request(
            "invalid_idempotency_key",
            "idempotency_key cannot be empty",
        )));
    }

    let created = state
        .engine()
        .create_waitpoint(
            ctx.env_id(),
            WaitpointKind::ManualToken,
            CreateWaitpointOptions {
                idempotency_key: req.idempotency_key,
                completed_by_run: None,
                completed_after: req.timeout,
            },
        )
        .await
        .map_err(|e| ctx.error(e))?;

    let status = if created.is_cached {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(CreateTokenResponse {
            id: created.waitpoint.friendly_id(),
            is_cached: created.is_cached,
        }),
    ))
}

/// POST /api/v1/waitpoints/tokens/{waitpoint_friendly_id}/complete
///
/// Completing an already-completed token succeeds without changing it.
async fn complete_token(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(waitpoint_friendly_id): Path<String>,
    Json(req): Json<CompleteTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // A malformed id cannot resolve in any environment.
    let waitpoint_id: WaitpointId = waitpoint_friendly_id
        .parse()
        .map_err(|_| ctx.error(EngineError::waitpoint_not_found(&waitpoint_friendly_id)))?;

    let data = IoPacket::from_json(req.data.as_ref()).map_err(|e| ctx.error(EngineError::from(e)))?;

    state
        .engine()
        .complete_waitpoint_token(ctx.env_id(), &waitpoint_id, data)
        .await
        .map_err(|e| ctx.error(e))?;

    Ok(Json(CompleteTokenResponse { success: true }))
}
