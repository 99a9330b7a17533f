//! Waitpoint coordination: creation, blocking, completion, resumption.
//!
//! Completion is a compare-and-set in the repository, so exactly one caller
//! records the output. Every completion call, first or duplicate, then
//! sweeps the reverse index and resumes whatever is still bound. A run that
//! raced into `block_run_on` just as the waitpoint completed is therefore
//! never stranded: either the sweep finds its binding, or `block_run_on`
//! sees the completed waitpoint after binding and resumes it itself.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use runway_id::{EnvId, RunId, WaitpointId};
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::lock::RunLockManager;
use crate::model::{Output, Run, RunStatus, Waitpoint, WaitpointKind, WaitpointStatus};
use crate::queue::{QueueEntry, QueueStore};
use crate::repository::RunRepository;

/// Optional attributes of a new waitpoint.
#[derive(Debug, Clone, Default)]
pub struct CreateWaitpointOptions {
    /// Returns the existing waitpoint when reused within the environment.
    pub idempotency_key: Option<String>,
    /// Producing run, for `RUN_COMPLETION`.
    pub completed_by_run: Option<RunId>,
    /// Due instant for `DATE_TIME`, or the caller-supplied timeout of a token.
    pub completed_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreatedWaitpoint {
    pub waitpoint: Waitpoint,
    /// True when an idempotency key matched an existing waitpoint.
    pub is_cached: bool,
}

#[derive(Debug, Clone)]
pub struct WaitpointCompletion {
    pub waitpoint: Waitpoint,
    /// The waitpoint had been completed by an earlier call.
    pub already_completed: bool,
    /// Runs re-enqueued by this call, in no particular order.
    pub resumed_runs: Vec<RunId>,
}

/// Creates, binds and completes waitpoints.
#[derive(Clone)]
pub struct WaitpointCoordinator {
    repository: Arc<dyn RunRepository>,
    queue: Arc<dyn QueueStore>,
    locks: RunLockManager,
}

impl WaitpointCoordinator {
    pub fn new(
        repository: Arc<dyn RunRepository>,
        queue: Arc<dyn QueueStore>,
        locks: RunLockManager,
    ) -> Self {
        Self {
            repository,
            queue,
            locks,
        }
    }

    #[instrument(skip(self, options), fields(env_id = %env_id, kind = kind.as_str()))]
    pub async fn create_waitpoint(
        &self,
        env_id: &EnvId,
        kind: WaitpointKind,
        options: CreateWaitpointOptions,
    ) -> EngineResult<CreatedWaitpoint> {
        if let Some(key) = options.idempotency_key.as_deref() {
            if let Some(existing) = self
                .repository
                .find_waitpoint_by_idempotency_key(env_id, key)
                .await?
            {
                debug!(waitpoint_id = %existing.id, "Idempotency key matched existing waitpoint");
                return Ok(CreatedWaitpoint {
                    waitpoint: existing,
                    is_cached: true,
                });
            }
        }

        let candidate = Waitpoint {
            id: WaitpointId::new(),
            env_id: *env_id,
            kind,
            status: WaitpointStatus::Pending,
            output: None,
            idempotency_key: options.idempotency_key,
            completed_by_run: options.completed_by_run,
            completed_after: options.completed_after,
            created_at: Utc::now(),
            completed_at: None,
        };

        let stored = self.repository.create_waitpoint(&candidate).await?;
        let is_cached = stored.id != candidate.id;
        if !is_cached {
            debug!(waitpoint_id = %stored.id, "Created waitpoint");
        }
        Ok(CreatedWaitpoint {
            waitpoint: stored,
            is_cached,
        })
    }

    /// Blocks a run on a waitpoint of the same environment.
    ///
    /// Blocking on an already-completed waitpoint leaves the run as it is.
    #[instrument(skip(self), fields(env_id = %env_id, run_id = %run_id, waitpoint_id = %waitpoint_id))]
    pub async fn block_run_on(
        &self,
        env_id: &EnvId,
        run_id: &RunId,
        waitpoint_id: &WaitpointId,
    ) -> EngineResult<Run> {
        let waitpoint = self
            .repository
            .find_waitpoint(env_id, waitpoint_id)
            .await?
            .ok_or_else(|| EngineError::waitpoint_not_found(waitpoint_id))?;

        let (run, newly_blocked) = self
            .locks
            .with_lock(run_id, |fence| async move {
                let mut run = self
                    .repository
                    .find_run(env_id, run_id)
                    .await?
                    .ok_or_else(|| EngineError::run_not_found(run_id))?;

                if run.status.is_terminal() {
                    return Err(EngineError::InvalidState {
                        run_id: *run_id,
                        status: run.status.to_string(),
                        action: "block",
                    });
                }
                match run.blocking_waitpoint {
                    Some(current) if current == *waitpoint_id => return Ok((run, false)),
                    Some(_) => {
                        return Err(EngineError::InvalidState {
                            run_id: *run_id,
                            status: run.status.to_string(),
                            action: "block on a second waitpoint",
                        })
                    }
                    None => {}
                }
                if waitpoint.is_completed() {
                    return Ok((run, false));
                }

                let was_queued = run.status == RunStatus::Pending
                    && fence.commit(self.queue.remove(env_id, run_id)).await?;
                let previous = run.clone();

                if let Err(e) = fence
                    .commit(self.repository.bind_run(run_id, waitpoint_id))
                    .await
                {
                    if was_queued {
                        self.queue.enqueue(QueueEntry::for_run(&previous)).await?;
                    }
                    return Err(e);
                }

                run.status = RunStatus::Blocked;
                run.blocking_waitpoint = Some(*waitpoint_id);
                run.lease = None;
                run.updated_at = Utc::now();

                if let Err(e) = fence.commit(self.repository.update_run(&run)).await {
                    self.repository.unbind_run(run_id, waitpoint_id).await?;
                    if was_queued {
                        self.queue.enqueue(QueueEntry::for_run(&previous)).await?;
                    }
                    return Err(e);
                }
                Ok((run, true))
            })
            .await?;

        if !newly_blocked {
            return Ok(run);
        }
        info!("Run blocked on waitpoint");

        // The waitpoint may have completed between the scoped lookup and the
        // binding; its completion sweep could have missed us.
        let current = self
            .repository
            .find_waitpoint(env_id, waitpoint_id)
            .await?;
        if current.is_some_and(|w| w.is_completed()) && self.resume_run(run_id, waitpoint_id).await?
        {
            debug!("Waitpoint completed while blocking, resumed immediately");
            return self
                .repository
                .get_run(run_id)
                .await?
                .ok_or_else(|| EngineError::run_not_found(run_id));
        }
        Ok(run)
    }

    /// Completes a waitpoint within the caller's environment.
    ///
    /// A duplicate completion is a success that leaves the stored output
    /// untouched. A waitpoint in another environment is `NotFound`.
    #[instrument(skip(self, output), fields(env_id = %env_id, waitpoint_id = %waitpoint_id))]
    pub async fn complete_waitpoint(
        &self,
        env_id: &EnvId,
        waitpoint_id: &WaitpointId,
        output: Option<Output>,
    ) -> EngineResult<WaitpointCompletion> {
        self.repository
            .find_waitpoint(env_id, waitpoint_id)
            .await?
            .ok_or_else(|| EngineError::waitpoint_not_found(waitpoint_id))?;

        let transitioned = self
            .repository
            .complete_waitpoint(waitpoint_id, output.as_ref(), Utc::now())
            .await?;
        if transitioned {
            info!("Waitpoint completed");
        } else {
            debug!("Waitpoint already completed");
        }

        let resumed_runs = self.resume_bound_runs(waitpoint_id).await?;

        let waitpoint = self
            .repository
            .find_waitpoint(env_id, waitpoint_id)
            .await?
            .ok_or_else(|| EngineError::waitpoint_not_found(waitpoint_id))?;

        Ok(WaitpointCompletion {
            waitpoint,
            already_completed: !transitioned,
            resumed_runs,
        })
    }

    /// Completes every `DATE_TIME` waitpoint due at `now`. Returns how many
    /// this call completed.
    ///
    /// A failure on one waitpoint does not stop the batch. A waitpoint that
    /// completed but could not resume its runs is handled by
    /// [`Self::resume_stranded_runs`].
    pub async fn complete_due_datetime_waitpoints(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<usize> {
        let due = self.repository.due_datetime_waitpoints(now, limit).await?;
        let mut completed = 0;
        for waitpoint in due {
            match self
                .complete_waitpoint(&waitpoint.env_id, &waitpoint.id, None)
                .await
            {
                Ok(completion) if !completion.already_completed => completed += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(waitpoint_id = %waitpoint.id, error = %e, "Failed to complete due waitpoint");
                }
            }
        }
        Ok(completed)
    }

    /// Resumes runs still bound to completed waitpoints, which is what a
    /// failed resume leaves behind. Returns how many runs were resumed.
    pub async fn resume_stranded_runs(&self, limit: usize) -> EngineResult<usize> {
        let stranded = self
            .repository
            .completed_waitpoints_with_bindings(limit)
            .await?;
        let mut resumed = 0;
        for waitpoint in stranded {
            match self.resume_bound_runs(&waitpoint.id).await {
                Ok(runs) => resumed += runs.len(),
                Err(e) => {
                    warn!(waitpoint_id = %waitpoint.id, error = %e, "Stranded bindings still not resumed");
                }
            }
        }
        if resumed > 0 {
            info!(count = resumed, "Resumed runs left on completed waitpoints");
        }
        Ok(resumed)
    }

    /// Resumes every run bound to a completed waitpoint.
    ///
    /// Each run is handled under its own lock. One failure does not stop the
    /// sweep; the first error is returned after every binding was tried, and
    /// the bindings that remain are retried by the stranded sweep.
    async fn resume_bound_runs(&self, waitpoint_id: &WaitpointId) -> EngineResult<Vec<RunId>> {
        let bound = self.repository.blocked_runs(waitpoint_id).await?;
        let mut resumed = Vec::with_capacity(bound.len());
        let mut first_error = None;

        for run_id in bound {
            match self.resume_run(&run_id, waitpoint_id).await {
                Ok(true) => resumed.push(run_id),
                Ok(false) => {}
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Failed to resume blocked run");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(resumed),
        }
    }

    /// Moves one bound run back to its environment queue. Returns false for
    /// a stale binding, which is dropped.
    async fn resume_run(&self, run_id: &RunId, waitpoint_id: &WaitpointId) -> EngineResult<bool> {
        self.locks
            .with_lock(run_id, |fence| async move {
                let run = self.repository.get_run(run_id).await?;
                let Some(mut run) = run.filter(|run| {
                    run.status == RunStatus::Blocked
                        && run.blocking_waitpoint.as_ref() == Some(waitpoint_id)
                }) else {
                    fence
                        .commit(self.repository.unbind_run(run_id, waitpoint_id))
                        .await?;
                    return Ok(false);
                };

                let blocked = run.clone();
                run.status = RunStatus::Pending;
                run.blocking_waitpoint = None;
                run.updated_at = Utc::now();
                fence.commit(self.repository.update_run(&run)).await?;

                if let Err(e) = fence
                    .commit(self.queue.enqueue(QueueEntry::for_run(&run)))
                    .await
                {
                    self.repository.update_run(&blocked).await?;
                    return Err(e);
                }
                if let Err(e) = self.repository.unbind_run(run_id, waitpoint_id).await {
                    warn!(run_id = %run_id, error = %e, "Resumed run left a stale binding");
                }

                debug!(run_id = %run_id, "Resumed run");
                Ok(true)
            })
            .await
    }
}
