//! HTTP API handlers and routing.
//!
//! Every `/api/v1` route resolves the caller's environment through
//! [`request_context::RequestContext`] before touching the engine.

pub mod error;
mod health;
pub mod request_context;
mod v1;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        .nest("/api/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
