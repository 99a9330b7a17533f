//! Run and waitpoint persistence.
//!
//! The engine reaches metadata storage only through [`RunRepository`].
//! Environment-scoped finders are the tenant boundary: a record that exists
//! in another environment is indistinguishable from one that does not exist.
//!
//! Implementations:
//! - [`MemoryRunRepository`] for tests and single-node development
//! - [`PgRunRepository`] over Postgres (sqlx)

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runway_id::{EnvId, RunId, WaitpointId};
use thiserror::Error;

use crate::model::{Output, Run, Waitpoint};

pub use memory::MemoryRunRepository;
pub use postgres::PgRunRepository;

/// Result type for repository operations.
pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// A stored row could not be decoded into a record.
    #[error("corrupt record {id}: {message}")]
    Corrupt { id: String, message: String },

    #[error("duplicate record: {0}")]
    Duplicate(String),
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, run: &Run) -> RepositoryResult<()>;

    /// Removes a run that never became visible (trigger rollback).
    async fn delete_run(&self, run_id: &RunId) -> RepositoryResult<()>;

    /// Finds a run within an environment.
    async fn find_run(&self, env_id: &EnvId, run_id: &RunId) -> RepositoryResult<Option<Run>>;

    /// Unscoped lookup for engine-internal paths that already hold an id
    /// obtained from a scoped source (queue entries, bindings).
    async fn get_run(&self, run_id: &RunId) -> RepositoryResult<Option<Run>>;

    /// Persists every mutable field. Callers hold the run lock.
    async fn update_run(&self, run: &Run) -> RepositoryResult<()>;

    /// Inserts a waitpoint, or returns the existing one when its
    /// idempotency key is already taken in the environment.
    async fn create_waitpoint(&self, waitpoint: &Waitpoint) -> RepositoryResult<Waitpoint>;

    async fn find_waitpoint(
        &self,
        env_id: &EnvId,
        waitpoint_id: &WaitpointId,
    ) -> RepositoryResult<Option<Waitpoint>>;

    async fn find_waitpoint_by_idempotency_key(
        &self,
        env_id: &EnvId,
        idempotency_key: &str,
    ) -> RepositoryResult<Option<Waitpoint>>;

    /// Compare-and-set `PENDING → COMPLETED`. Returns true only for the
    /// caller whose write performed the transition.
    async fn complete_waitpoint(
        &self,
        waitpoint_id: &WaitpointId,
        output: Option<&Output>,
        completed_at: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    /// Pending `RUN_COMPLETION` waitpoints produced by a run.
    async fn completion_waitpoints_for_run(
        &self,
        run_id: &RunId,
    ) -> RepositoryResult<Vec<Waitpoint>>;

    /// Pending `DATE_TIME` waitpoints whose instant is at or before `now`.
    async fn due_datetime_waitpoints(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Waitpoint>>;

    /// Completed waitpoints that still have runs bound to them, oldest
    /// completion first.
    async fn completed_waitpoints_with_bindings(
        &self,
        limit: usize,
    ) -> RepositoryResult<Vec<Waitpoint>>;

    async fn bind_run(&self, run_id: &RunId, waitpoint_id: &WaitpointId) -> RepositoryResult<()>;

    async fn unbind_run(&self, run_id: &RunId, waitpoint_id: &WaitpointId)
        -> RepositoryResult<()>;

    /// Reverse index: runs currently bound to a waitpoint.
    async fn blocked_runs(&self, waitpoint_id: &WaitpointId) -> RepositoryResult<Vec<RunId>>;
}
