//! Resource-budgeted, round-robin dequeue.
//!
//! Each call walks the master queue's member environments starting at the
//! shared rotation cursor and takes at most one run per environment per
//! pass, so a tenant with a deep backlog cannot starve its neighbours.
//!
//! Admission is FIFO-respecting: when an environment's head run does not fit
//! the remaining budget, that environment is dropped for the rest of the call
//! and its head stays queued. Nothing further back is considered.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use runway_id::{EnvId, LeaseId};
use tracing::{debug, instrument, warn};

use super::{QueueEntry, QueueStore};
use crate::error::{EngineError, EngineResult};
use crate::lock::RunLockManager;
use crate::machines::{MachinePreset, MachinePresetCatalog, MachineResources};
use crate::model::{LeasedRun, RunLease, RunStatus};
use crate::repository::RunRepository;

/// Slack for accumulated float error when comparing against a budget.
const BUDGET_EPSILON: f64 = 1e-9;

/// Arguments to [`DequeueScheduler::dequeue`].
#[derive(Debug, Clone)]
pub struct DequeueRequest {
    pub consumer_id: String,
    pub master_queue: String,
    pub max_run_count: usize,
    /// Cumulative cpu/memory ceiling. `None` means only `max_run_count`
    /// applies.
    pub max_resources: Option<MachineResources>,
}

/// Running totals for one dequeue call.
#[derive(Debug, Default)]
struct Budget {
    limit: Option<MachineResources>,
    used: MachineResources,
}

impl Budget {
    fn new(limit: Option<MachineResources>) -> Self {
        Self {
            limit,
            used: MachineResources::default(),
        }
    }

    fn fits(&self, cost: MachineResources) -> bool {
        match self.limit {
            None => true,
            Some(limit) => {
                self.used.cpu + cost.cpu <= limit.cpu + BUDGET_EPSILON
                    && self.used.memory + cost.memory <= limit.memory + BUDGET_EPSILON
            }
        }
    }

    fn charge(&mut self, cost: MachineResources) {
        self.used.cpu += cost.cpu;
        self.used.memory += cost.memory;
    }
}

/// Outcome of trying to lease one head-of-queue run.
enum Admission {
    Leased(LeasedRun),
    /// Another consumer took the reference first; the environment may still
    /// hold more work.
    Contended,
}

/// Pulls runs out of a master queue under a consumer's budget.
#[derive(Clone)]
pub struct DequeueScheduler {
    queue: Arc<dyn QueueStore>,
    repository: Arc<dyn RunRepository>,
    locks: RunLockManager,
    catalog: Arc<MachinePresetCatalog>,
}

impl DequeueScheduler {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        repository: Arc<dyn RunRepository>,
        locks: RunLockManager,
        catalog: Arc<MachinePresetCatalog>,
    ) -> Self {
        Self {
            queue,
            repository,
            locks,
            catalog,
        }
    }

    /// Leases up to `max_run_count` runs whose cumulative preset cost fits
    /// `max_resources`. An empty result is a normal outcome.
    #[instrument(skip(self, request), fields(master_queue = %request.master_queue, consumer_id = %request.consumer_id))]
    pub async fn dequeue(&self, request: &DequeueRequest) -> EngineResult<Vec<LeasedRun>> {
        let mut leased = Vec::new();
        if request.max_run_count == 0 {
            return Ok(leased);
        }

        let mut candidates: VecDeque<EnvId> = self
            .queue
            .rotate_master(&request.master_queue)
            .await?
            .into();
        let mut budget = Budget::new(request.max_resources);

        while leased.len() < request.max_run_count {
            let Some(env_id) = candidates.pop_front() else {
                break;
            };

            let Some(head) = self.queue.peek(&env_id).await? else {
                continue;
            };

            let preset = self.preset_for(&head);
            let cost = preset.resources();
            if !budget.fits(cost) {
                debug!(
                    env_id = %env_id,
                    run_id = %head.run_id,
                    machine = %preset.name,
                    "Head run exceeds remaining budget, skipping environment"
                );
                continue;
            }

            match self.admit(&head, preset, &request.consumer_id).await {
                Ok(Admission::Leased(run)) => {
                    budget.charge(cost);
                    leased.push(run);
                    candidates.push_back(env_id);
                }
                Ok(Admission::Contended) => candidates.push_back(env_id),
                Err(EngineError::LockTimeout { run_id }) => {
                    warn!(env_id = %env_id, run_id = %run_id, "Run lock busy, skipping environment");
                }
                Err(EngineError::LockLost { run_id }) => {
                    warn!(env_id = %env_id, run_id = %run_id, "Run lock lease ran out, skipping environment");
                }
                Err(e) => {
                    if leased.is_empty() {
                        return Err(e);
                    }
                    warn!(error = %e, leased = leased.len(), "Dequeue interrupted, returning partial result");
                    break;
                }
            }
        }

        debug!(count = leased.len(), "Dequeued runs");
        Ok(leased)
    }

    fn preset_for(&self, entry: &QueueEntry) -> MachinePreset {
        match self.catalog.get(&entry.machine_preset) {
            Some(preset) => preset.clone(),
            None => {
                warn!(
                    run_id = %entry.run_id,
                    machine = %entry.machine_preset,
                    "Queued run references unknown machine preset, using default"
                );
                self.catalog.default_preset().clone()
            }
        }
    }

    /// Leases one head-of-queue run. Reads happen first; the queue removal
    /// and the status write are each fenced, and a failed status write puts
    /// the reference back.
    async fn admit(
        &self,
        entry: &QueueEntry,
        machine: MachinePreset,
        consumer_id: &str,
    ) -> EngineResult<Admission> {
        self.locks
            .with_lock(&entry.run_id, |fence| async move {
                let run = self.repository.get_run(&entry.run_id).await?;
                let Some(mut run) = run.filter(|run| run.status == RunStatus::Pending) else {
                    warn!(run_id = %entry.run_id, "Queued reference has no pending run, dropping");
                    fence
                        .commit(self.queue.remove(&entry.env_id, &entry.run_id))
                        .await?;
                    return Ok(Admission::Contended);
                };

                if !fence
                    .commit(self.queue.remove(&entry.env_id, &entry.run_id))
                    .await?
                {
                    return Ok(Admission::Contended);
                }

                let now = Utc::now();
                let lease = RunLease {
                    lease_id: LeaseId::new(),
                    consumer_id: consumer_id.to_string(),
                    leased_at: now,
                };
                run.status = RunStatus::Dequeued;
                run.lease = Some(lease.clone());
                run.updated_at = now;

                if let Err(e) = fence.commit(self.repository.update_run(&run)).await {
                    self.queue.enqueue(entry.clone()).await?;
                    return Err(e);
                }

                Ok(Admission::Leased(LeasedRun {
                    run_id: run.id,
                    env_id: run.env_id,
                    task_identifier: run.task_identifier,
                    queue_name: run.queue_name,
                    machine,
                    lease,
                    payload: run.payload,
                }))
            })
            .await
    }
}
