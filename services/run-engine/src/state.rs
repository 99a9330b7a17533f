//! Application state shared across request handlers.

use std::sync::Arc;

use crate::auth::Authenticator;
use crate::db::Database;
use crate::engine::RunEngine;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: RunEngine,
    authenticator: Arc<dyn Authenticator>,
    master_queue: String,
    db: Option<Database>,
}

impl AppState {
    pub fn new(
        engine: RunEngine,
        authenticator: Arc<dyn Authenticator>,
        master_queue: impl Into<String>,
        db: Option<Database>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                engine,
                authenticator,
                master_queue: master_queue.into(),
                db,
            }),
        }
    }

    pub fn engine(&self) -> &RunEngine {
        &self.inner.engine
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.inner.authenticator.as_ref()
    }

    /// Master queue that API-triggered runs are attached to.
    pub fn master_queue(&self) -> &str {
        &self.inner.master_queue
    }

    /// Present when runs are persisted in Postgres.
    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }
}
