//! Error taxonomy for engine operations.
//!
//! The engine classifies failures; it never formats them for a transport.
//! The HTTP layer maps these kinds to status codes (see `api::error`).

use runway_id::RunId;
use thiserror::Error;

use crate::lock::LockError;
use crate::payload::ExportError;
use crate::queue::QueueError;
use crate::repository::RepositoryError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by engine operations.
///
/// A duplicate waitpoint completion and an infeasible head-of-queue run are
/// normal outcomes, not errors, and have no variant here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The run or waitpoint does not resolve within the caller's environment.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The run lock could not be acquired within the configured bound.
    #[error("timed out acquiring lock for run {run_id}")]
    LockTimeout { run_id: RunId },

    /// The run lock lease expired before the operation could write.
    #[error("lock lost for run {run_id}")]
    LockLost { run_id: RunId },

    /// The payload export collaborator failed.
    #[error("payload export failed: {0}")]
    Export(#[from] ExportError),

    /// The requested transition is not valid from the run's current status.
    #[error("run {run_id} cannot {action} while {status}")]
    InvalidState {
        run_id: RunId,
        status: String,
        action: &'static str,
    },

    /// The caller does not hold the lease it presented.
    #[error("lease mismatch for run {run_id}")]
    LeaseMismatch { run_id: RunId },

    /// The machine preset name is not in the catalog.
    #[error("unknown machine preset: {0}")]
    UnknownMachinePreset(String),

    /// The engine has been shut down with `quit`.
    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue store error: {0}")]
    Queue(#[from] QueueError),

    #[error("lock service error: {0}")]
    Lock(#[from] LockError),
}

impl EngineError {
    pub(crate) fn run_not_found(run_id: &RunId) -> Self {
        Self::NotFound {
            kind: "run",
            id: run_id.to_string(),
        }
    }

    pub(crate) fn waitpoint_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "waitpoint",
            id: id.to_string(),
        }
    }

    /// Returns true if the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::LockLost { .. }
                | Self::Repository(_)
                | Self::Queue(_)
                | Self::Lock(_)
        )
    }

    /// Returns true for the not-found classification.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
