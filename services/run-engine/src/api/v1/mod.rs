//! API v1 routes.

mod queues;
mod runs;
mod tasks;
mod waitpoints;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/waitpoints/tokens", waitpoints::routes())
        .nest("/tasks", tasks::routes())
        .nest("/runs", runs::routes())
        .nest("/queues", queues::routes())
}
