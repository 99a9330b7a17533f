//! Environment queues, the master queue index, and the dequeue scheduler.
//!
//! Queue state lives behind [`QueueStore`], a capability over a shared
//! ordered-set store. Every method is a single atomic primitive: there is no
//! read-then-write window a concurrent consumer could slip into.
//!
//! - An environment queue holds run references ordered by [`QueueScore`].
//! - A master queue is the set of environment queues that currently hold at
//!   least one reference. Membership is added on first enqueue and dropped
//!   when the environment queue empties.

mod memory;
mod scheduler;

use std::cmp::Ordering;

use async_trait::async_trait;
use runway_id::{EnvId, RunId};
use thiserror::Error;

use crate::model::Run;

pub use memory::MemoryQueueStore;
pub use scheduler::{DequeueRequest, DequeueScheduler};

/// Result type for queue store operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error, Clone)]
pub enum QueueError {
    /// An environment queue is attached to one master queue at a time.
    #[error("environment {env_id} is attached to master queue '{attached}', not '{requested}'")]
    MasterQueueMismatch {
        env_id: EnvId,
        attached: String,
        requested: String,
    },

    #[error("queue backend unavailable: {0}")]
    Backend(String),
}

/// Ordering key within one environment queue.
///
/// Higher priority is delivered first; equal priorities are delivered in
/// enqueue-sequence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueScore {
    pub priority: i32,
    pub sequence: u64,
}

impl Ord for QueueScore {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for QueueScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A run reference as stored in an environment queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub run_id: RunId,
    pub env_id: EnvId,
    pub master_queue: String,
    /// Preset name, so admission needs no record lookup.
    pub machine_preset: String,
    pub score: QueueScore,
}

impl QueueEntry {
    pub fn for_run(run: &Run) -> Self {
        Self {
            run_id: run.id,
            env_id: run.env_id,
            master_queue: run.master_queue.clone(),
            machine_preset: run.machine_preset.clone(),
            score: QueueScore {
                priority: run.priority,
                sequence: run.sequence,
            },
        }
    }
}

/// Shared ordered-set store backing environment and master queues.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Next enqueue sequence for an environment (atomic increment).
    async fn next_sequence(&self, env_id: &EnvId) -> QueueResult<u64>;

    /// Inserts a reference and attaches its environment to the master queue.
    ///
    /// A reference already queued anywhere is moved, never duplicated.
    async fn enqueue(&self, entry: QueueEntry) -> QueueResult<()>;

    /// Removes a specific reference. Returns false if it was not queued,
    /// which is how a consumer learns it lost a race for that run.
    async fn remove(&self, env_id: &EnvId, run_id: &RunId) -> QueueResult<bool>;

    async fn length(&self, env_id: &EnvId) -> QueueResult<usize>;

    /// Head of an environment queue without removing it.
    async fn peek(&self, env_id: &EnvId) -> QueueResult<Option<QueueEntry>>;

    /// Member environments of a master queue in round-robin order.
    ///
    /// Each call advances the shared rotation cursor by one so successive
    /// consumers start from different environments.
    async fn rotate_master(&self, master_queue: &str) -> QueueResult<Vec<EnvId>>;

    /// Member environments without advancing the rotation.
    async fn master_members(&self, master_queue: &str) -> QueueResult<Vec<EnvId>>;
}
