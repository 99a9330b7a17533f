//! Run and waitpoint records.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use runway_id::{EnvId, LeaseId, RunId, WaitpointId};
use serde::{Deserialize, Serialize};

use crate::machines::MachinePreset;
use crate::payload::IoPacket;

// =============================================================================
// Payloads
// =============================================================================

/// A payload after the export decision: carried opaquely from then on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadPacket {
    /// Bytes small enough to store alongside the record.
    Inline { data: Bytes, data_type: String },
    /// Bytes offloaded to the object store under `storage_key`.
    Reference {
        storage_key: String,
        data_type: String,
    },
}

impl PayloadPacket {
    pub fn data_type(&self) -> &str {
        match self {
            Self::Inline { data_type, .. } | Self::Reference { data_type, .. } => data_type,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. })
    }
}

/// Output attached to a completed waitpoint or a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub packet: PayloadPacket,
    pub is_error: bool,
}

impl Output {
    pub fn success(packet: PayloadPacket) -> Self {
        Self {
            packet,
            is_error: false,
        }
    }

    pub fn error(packet: PayloadPacket) -> Self {
        Self {
            packet,
            is_error: true,
        }
    }
}

// =============================================================================
// Runs
// =============================================================================

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Queued and eligible for dequeue.
    Pending,
    /// Leased to a consumer.
    Dequeued,
    /// Waiting on a waitpoint; not queued.
    Blocked,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Dequeued => "DEQUEUED",
            Self::Blocked => "BLOCKED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "DEQUEUED" => Some(Self::Dequeued),
            "BLOCKED" => Some(Self::Blocked),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal runs are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding between a dequeued run and the consumer that took it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub lease_id: LeaseId,
    pub consumer_id: String,
    pub leased_at: DateTime<Utc>,
}

/// A persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub env_id: EnvId,
    pub task_identifier: String,
    pub queue_name: String,
    pub master_queue: String,
    pub machine_preset: String,
    pub payload: PayloadPacket,
    pub status: RunStatus,
    /// Enqueue sequence, monotonic per environment.
    pub sequence: u64,
    pub priority: i32,
    pub is_test: bool,
    pub blocking_waitpoint: Option<WaitpointId>,
    pub lease: Option<RunLease>,
    pub output: Option<Output>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn friendly_id(&self) -> String {
        self.id.to_friendly()
    }
}

/// Parent linkage for trigger-and-wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRun {
    pub run_id: RunId,
    /// Block the parent on the child's completion waitpoint.
    pub resume_on_completion: bool,
}

/// Everything `trigger` needs to create a run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Caller-chosen identity of the new run.
    pub friendly_id: RunId,
    pub env_id: EnvId,
    pub task_identifier: String,
    pub payload: IoPacket,
    pub queue_name: String,
    pub master_queue: String,
    pub machine: Option<String>,
    pub priority: Option<i32>,
    pub is_test: bool,
    pub parent: Option<ParentRun>,
}

/// A run handed to a consumer by the dequeue scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct LeasedRun {
    pub run_id: RunId,
    pub env_id: EnvId,
    pub task_identifier: String,
    pub queue_name: String,
    /// Snapshot of the preset at dequeue time.
    pub machine: MachinePreset,
    pub lease: RunLease,
    pub payload: PayloadPacket,
}

// =============================================================================
// Waitpoints
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitpointKind {
    ManualToken,
    RunCompletion,
    DateTime,
}

impl WaitpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualToken => "MANUAL_TOKEN",
            Self::RunCompletion => "RUN_COMPLETION",
            Self::DateTime => "DATE_TIME",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MANUAL_TOKEN" => Some(Self::ManualToken),
            "RUN_COMPLETION" => Some(Self::RunCompletion),
            "DATE_TIME" => Some(Self::DateTime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitpointStatus {
    Pending,
    Completed,
}

impl WaitpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A one-shot synchronization object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waitpoint {
    pub id: WaitpointId,
    pub env_id: EnvId,
    pub kind: WaitpointKind,
    pub status: WaitpointStatus,
    pub output: Option<Output>,
    pub idempotency_key: Option<String>,
    /// Producing run for `RUN_COMPLETION` waitpoints.
    pub completed_by_run: Option<RunId>,
    /// Due instant for `DATE_TIME` waitpoints.
    pub completed_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Waitpoint {
    pub fn is_completed(&self) -> bool {
        self.status == WaitpointStatus::Completed
    }

    pub fn friendly_id(&self) -> String {
        self.id.to_friendly()
    }
}
