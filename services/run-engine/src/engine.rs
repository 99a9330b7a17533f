//! The run engine facade.
//!
//! [`RunEngine`] composes the queue store, lock manager, dequeue scheduler,
//! waitpoint coordinator and payload exporter behind the operations the HTTP
//! layer and workers call. Callers pass an environment id that has already
//! been resolved by an `Authenticator`; every lookup is scoped by it.
//!
//! Run locks are never nested. Operations that touch two runs (a parent
//! waiting on a child, a finished run resuming its waiters) take the locks
//! one after the other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use runway_id::{EnvId, LeaseId, RunId, Ulid, WaitpointId};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::lock::{LockConfig, LockService, MemoryLockService, RunLockManager};
use crate::machines::{MachineConfig, MachinePresetCatalog};
use crate::model::{
    LeasedRun, Output, ParentRun, PayloadPacket, Run, RunSpec, RunStatus, Waitpoint,
    WaitpointKind,
};
use crate::payload::{
    ConditionalExporter, IoPacket, MemoryObjectStore, PayloadExporter, DEFAULT_INLINE_THRESHOLD,
};
use crate::queue::{DequeueRequest, DequeueScheduler, MemoryQueueStore, QueueEntry, QueueStore};
use crate::repository::{MemoryRunRepository, RunRepository};
use crate::waitpoints::{
    CreateWaitpointOptions, CreatedWaitpoint, WaitpointCompletion, WaitpointCoordinator,
};

/// Collaborators and settings for [`RunEngine::new`].
pub struct EngineOptions {
    pub repository: Arc<dyn RunRepository>,
    pub queue: Arc<dyn QueueStore>,
    pub lock_service: Arc<dyn LockService>,
    pub exporter: Arc<dyn PayloadExporter>,
    pub machines: MachineConfig,
    pub lock: LockConfig,
}

struct EngineInner {
    repository: Arc<dyn RunRepository>,
    queue: Arc<dyn QueueStore>,
    exporter: Arc<dyn PayloadExporter>,
    catalog: Arc<MachinePresetCatalog>,
    locks: RunLockManager,
    scheduler: DequeueScheduler,
    waitpoints: WaitpointCoordinator,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

/// Execution core: trigger, dequeue, waitpoints, run lifecycle.
#[derive(Clone)]
pub struct RunEngine {
    inner: Arc<EngineInner>,
}

impl RunEngine {
    pub fn new(options: EngineOptions) -> EngineResult<Self> {
        let catalog = Arc::new(MachinePresetCatalog::new(options.machines)?);
        let locks = RunLockManager::new(options.lock_service, options.lock);
        let scheduler = DequeueScheduler::new(
            options.queue.clone(),
            options.repository.clone(),
            locks.clone(),
            catalog.clone(),
        );
        let waitpoints = WaitpointCoordinator::new(
            options.repository.clone(),
            options.queue.clone(),
            locks.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(EngineInner {
                repository: options.repository,
                queue: options.queue,
                exporter: options.exporter,
                catalog,
                locks,
                scheduler,
                waitpoints,
                shutdown_tx,
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Engine over process-local collaborators.
    pub fn in_memory(machines: MachineConfig, lock: LockConfig) -> EngineResult<Self> {
        Self::new(EngineOptions {
            repository: Arc::new(MemoryRunRepository::new()),
            queue: Arc::new(MemoryQueueStore::new()),
            lock_service: Arc::new(MemoryLockService::new()),
            exporter: Arc::new(ConditionalExporter::new(
                Arc::new(MemoryObjectStore::new()),
                DEFAULT_INLINE_THRESHOLD,
            )),
            machines,
            lock,
        })
    }

    pub fn catalog(&self) -> &MachinePresetCatalog {
        &self.inner.catalog
    }

    pub fn run_queue(&self) -> &Arc<dyn QueueStore> {
        &self.inner.queue
    }

    pub fn waitpoints(&self) -> &WaitpointCoordinator {
        &self.inner.waitpoints
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Receiver flipped to `true` by [`RunEngine::quit`].
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    // =========================================================================
    // Trigger
    // =========================================================================

    /// Persists a run and enqueues it.
    ///
    /// Triggering an id that already exists in the environment returns the
    /// stored run. With a parent, a `RUN_COMPLETION` waitpoint for the new
    /// run is created first and the parent is blocked on it when asked to
    /// resume on completion.
    #[instrument(skip(self, spec), fields(env_id = %spec.env_id, run_id = %spec.friendly_id, task = %spec.task_identifier))]
    pub async fn trigger(&self, spec: RunSpec) -> EngineResult<Run> {
        self.ensure_running()?;
        let inner = &self.inner;

        if let Some(existing) = inner
            .repository
            .find_run(&spec.env_id, &spec.friendly_id)
            .await?
        {
            return Ok(existing);
        }

        let machine = inner.catalog.resolve(spec.machine.as_deref())?.name.clone();

        let payload_type = spec.payload.data_type.clone();
        let payload = inner
            .exporter
            .export(spec.payload.clone(), &format!("{}/payload", spec.friendly_id))
            .await?
            .unwrap_or(PayloadPacket::Inline {
                data: Bytes::new(),
                data_type: payload_type,
            });

        let completion = match &spec.parent {
            Some(parent) => Some(self.attach_parent(&spec, parent).await?),
            None => None,
        };

        let result = self.create_and_enqueue(&spec, machine, payload).await;

        if let (Err(e), Some(waitpoint)) = (&result, completion) {
            let output = error_output(&format!("Failed to trigger child run: {e}"));
            if let Err(complete_err) = inner
                .waitpoints
                .complete_waitpoint(&spec.env_id, &waitpoint.id, Some(output))
                .await
            {
                warn!(
                    waitpoint_id = %waitpoint.id,
                    error = %complete_err,
                    "Failed to release parent after child trigger failure"
                );
            }
        }

        let run = result?;
        info!(sequence = run.sequence, machine = %run.machine_preset, "Run triggered");
        Ok(run)
    }

    async fn attach_parent(
        &self,
        spec: &RunSpec,
        parent: &ParentRun,
    ) -> EngineResult<Waitpoint> {
        let inner = &self.inner;
        let parent_run = inner
            .repository
            .find_run(&spec.env_id, &parent.run_id)
            .await?
            .ok_or_else(|| EngineError::run_not_found(&parent.run_id))?;
        if parent_run.status.is_terminal() {
            return Err(EngineError::InvalidState {
                run_id: parent.run_id,
                status: parent_run.status.to_string(),
                action: "wait for a child run",
            });
        }

        let created = inner
            .waitpoints
            .create_waitpoint(
                &spec.env_id,
                WaitpointKind::RunCompletion,
                CreateWaitpointOptions {
                    idempotency_key: Some(format!("run-completion:{}", spec.friendly_id)),
                    completed_by_run: Some(spec.friendly_id),
                    completed_after: None,
                },
            )
            .await?;

        if parent.resume_on_completion {
            inner
                .waitpoints
                .block_run_on(&spec.env_id, &parent.run_id, &created.waitpoint.id)
                .await?;
        }
        Ok(created.waitpoint)
    }

    async fn create_and_enqueue(
        &self,
        spec: &RunSpec,
        machine: String,
        payload: PayloadPacket,
    ) -> EngineResult<Run> {
        let inner = &self.inner;
        inner
            .locks
            .with_lock(&spec.friendly_id, |fence| async move {
                if let Some(existing) = inner
                    .repository
                    .find_run(&spec.env_id, &spec.friendly_id)
                    .await?
                {
                    return Ok(existing);
                }

                let sequence = inner.queue.next_sequence(&spec.env_id).await?;
                let now = Utc::now();
                let run = Run {
                    id: spec.friendly_id,
                    env_id: spec.env_id,
                    task_identifier: spec.task_identifier.clone(),
                    queue_name: spec.queue_name.clone(),
                    master_queue: spec.master_queue.clone(),
                    machine_preset: machine,
                    payload,
                    status: RunStatus::Pending,
                    sequence,
                    priority: spec.priority.unwrap_or(0),
                    is_test: spec.is_test,
                    blocking_waitpoint: None,
                    lease: None,
                    output: None,
                    created_at: now,
                    updated_at: now,
                };

                fence.commit(inner.repository.create_run(&run)).await?;
                if let Err(e) = fence
                    .commit(inner.queue.enqueue(QueueEntry::for_run(&run)))
                    .await
                {
                    inner.repository.delete_run(&run.id).await?;
                    return Err(e);
                }
                Ok(run)
            })
            .await
    }

    // =========================================================================
    // Dequeue and queue introspection
    // =========================================================================

    pub async fn dequeue_from_master_queue(
        &self,
        request: &DequeueRequest,
    ) -> EngineResult<Vec<LeasedRun>> {
        self.ensure_running()?;
        self.inner.scheduler.dequeue(request).await
    }

    /// Pending references in an environment queue.
    pub async fn length_of_env_queue(&self, env_id: &EnvId) -> EngineResult<usize> {
        Ok(self.inner.queue.length(env_id).await?)
    }

    // =========================================================================
    // Waitpoints
    // =========================================================================

    pub async fn create_waitpoint(
        &self,
        env_id: &EnvId,
        kind: WaitpointKind,
        options: CreateWaitpointOptions,
    ) -> EngineResult<CreatedWaitpoint> {
        self.ensure_running()?;
        self.inner
            .waitpoints
            .create_waitpoint(env_id, kind, options)
            .await
    }

    pub async fn block_run_on(
        &self,
        env_id: &EnvId,
        run_id: &RunId,
        waitpoint_id: &WaitpointId,
    ) -> EngineResult<Run> {
        self.ensure_running()?;
        self.inner
            .waitpoints
            .block_run_on(env_id, run_id, waitpoint_id)
            .await
    }

    /// Completes a waitpoint with an already-exported output.
    pub async fn complete_waitpoint(
        &self,
        env_id: &EnvId,
        waitpoint_id: &WaitpointId,
        output: Option<Output>,
    ) -> EngineResult<WaitpointCompletion> {
        self.ensure_running()?;
        self.inner
            .waitpoints
            .complete_waitpoint(env_id, waitpoint_id, output)
            .await
    }

    /// Completes a token waitpoint from raw caller data.
    ///
    /// The waitpoint is resolved before anything is exported, so a foreign
    /// id leaves no object behind. An already-completed token exports
    /// nothing, and every export gets its own key, so a duplicate
    /// completion never touches the object the recorded output points at.
    #[instrument(skip(self, data), fields(env_id = %env_id, waitpoint_id = %waitpoint_id))]
    pub async fn complete_waitpoint_token(
        &self,
        env_id: &EnvId,
        waitpoint_id: &WaitpointId,
        data: IoPacket,
    ) -> EngineResult<WaitpointCompletion> {
        self.ensure_running()?;
        let inner = &self.inner;
        let waitpoint = inner
            .repository
            .find_waitpoint(env_id, waitpoint_id)
            .await?
            .ok_or_else(|| EngineError::waitpoint_not_found(waitpoint_id))?;

        let output = if waitpoint.is_completed() {
            None
        } else {
            let key = format!("{waitpoint_id}/waitpoint/token-{}", Ulid::new());
            inner
                .exporter
                .export(data, &key)
                .await?
                .map(Output::success)
        };

        inner
            .waitpoints
            .complete_waitpoint(env_id, waitpoint_id, output)
            .await
    }

    pub async fn get_waitpoint(
        &self,
        env_id: &EnvId,
        waitpoint_id: &WaitpointId,
    ) -> EngineResult<Waitpoint> {
        self.inner
            .repository
            .find_waitpoint(env_id, waitpoint_id)
            .await?
            .ok_or_else(|| EngineError::waitpoint_not_found(waitpoint_id))
    }

    // =========================================================================
    // Run lifecycle
    // =========================================================================

    pub async fn get_run(&self, env_id: &EnvId, run_id: &RunId) -> EngineResult<Run> {
        self.inner
            .repository
            .find_run(env_id, run_id)
            .await?
            .ok_or_else(|| EngineError::run_not_found(run_id))
    }

    /// Records a successful attempt for the lease holder.
    #[instrument(skip(self, output), fields(env_id = %env_id, run_id = %run_id))]
    pub async fn complete_run(
        &self,
        env_id: &EnvId,
        run_id: &RunId,
        lease_id: &LeaseId,
        output: IoPacket,
    ) -> EngineResult<Run> {
        self.finish_run(env_id, run_id, lease_id, output, RunStatus::Completed)
            .await
    }

    /// Records a failed attempt for the lease holder.
    #[instrument(skip(self, error), fields(env_id = %env_id, run_id = %run_id))]
    pub async fn fail_run(
        &self,
        env_id: &EnvId,
        run_id: &RunId,
        lease_id: &LeaseId,
        error: IoPacket,
    ) -> EngineResult<Run> {
        self.finish_run(env_id, run_id, lease_id, error, RunStatus::Failed)
            .await
    }

    async fn finish_run(
        &self,
        env_id: &EnvId,
        run_id: &RunId,
        lease_id: &LeaseId,
        data: IoPacket,
        status: RunStatus,
    ) -> EngineResult<Run> {
        self.ensure_running()?;
        let inner = &self.inner;
        let action = if status == RunStatus::Completed {
            "complete"
        } else {
            "fail"
        };

        let data_type = data.data_type.clone();
        let packet = inner
            .exporter
            .export(data, &format!("{run_id}/output"))
            .await?
            .unwrap_or(PayloadPacket::Inline {
                data: Bytes::new(),
                data_type,
            });
        let output = Output {
            packet,
            is_error: status == RunStatus::Failed,
        };

        let recorded = &output;
        let run = inner
            .locks
            .with_lock(run_id, |fence| async move {
                let mut run = inner
                    .repository
                    .find_run(env_id, run_id)
                    .await?
                    .ok_or_else(|| EngineError::run_not_found(run_id))?;

                if run.status != RunStatus::Dequeued {
                    return Err(EngineError::InvalidState {
                        run_id: *run_id,
                        status: run.status.to_string(),
                        action,
                    });
                }
                if run.lease.as_ref().map(|lease| lease.lease_id) != Some(*lease_id) {
                    return Err(EngineError::LeaseMismatch { run_id: *run_id });
                }

                run.status = status;
                run.output = Some(recorded.clone());
                run.lease = None;
                run.updated_at = Utc::now();
                fence.commit(inner.repository.update_run(&run)).await?;
                Ok(run)
            })
            .await?;

        info!(status = %run.status, "Run finished");
        self.complete_run_waitpoints(&run, output).await?;
        Ok(run)
    }

    /// Cancels a run that has not finished yet.
    #[instrument(skip(self), fields(env_id = %env_id, run_id = %run_id))]
    pub async fn cancel_run(&self, env_id: &EnvId, run_id: &RunId) -> EngineResult<Run> {
        self.ensure_running()?;
        let inner = &self.inner;
        let output = error_output("Run was cancelled");
        let recorded = &output;
        let run = inner
            .locks
            .with_lock(run_id, |fence| async move {
                let mut run = inner
                    .repository
                    .find_run(env_id, run_id)
                    .await?
                    .ok_or_else(|| EngineError::run_not_found(run_id))?;

                if run.status.is_terminal() {
                    return Err(EngineError::InvalidState {
                        run_id: *run_id,
                        status: run.status.to_string(),
                        action: "cancel",
                    });
                }

                let previous = run.clone();
                let mut was_queued = false;
                match (run.status, run.blocking_waitpoint) {
                    (RunStatus::Pending, _) => {
                        was_queued = fence.commit(inner.queue.remove(env_id, run_id)).await?;
                    }
                    (RunStatus::Blocked, Some(waitpoint_id)) => {
                        fence
                            .commit(inner.repository.unbind_run(run_id, &waitpoint_id))
                            .await?;
                    }
                    _ => {}
                }

                run.status = RunStatus::Failed;
                run.output = Some(recorded.clone());
                run.blocking_waitpoint = None;
                run.lease = None;
                run.updated_at = Utc::now();

                if let Err(e) = fence.commit(inner.repository.update_run(&run)).await {
                    if was_queued {
                        inner.queue.enqueue(QueueEntry::for_run(&previous)).await?;
                    }
                    if let Some(waitpoint_id) = previous.blocking_waitpoint {
                        inner.repository.bind_run(run_id, &waitpoint_id).await?;
                    }
                    return Err(e);
                }
                Ok(run)
            })
            .await?;

        info!("Run cancelled");
        self.complete_run_waitpoints(&run, output).await?;
        Ok(run)
    }

    /// Completes the `RUN_COMPLETION` waitpoints a finished run produces.
    ///
    /// Every waitpoint is tried; the first error is returned afterwards.
    /// Runs a failed resume leaves bound are picked up by the stranded sweep.
    async fn complete_run_waitpoints(&self, run: &Run, output: Output) -> EngineResult<()> {
        let inner = &self.inner;
        let waitpoints = inner.repository.completion_waitpoints_for_run(&run.id).await?;
        let mut first_error = None;
        for waitpoint in waitpoints {
            if let Err(e) = inner
                .waitpoints
                .complete_waitpoint(&waitpoint.env_id, &waitpoint.id, Some(output.clone()))
                .await
            {
                warn!(waitpoint_id = %waitpoint.id, error = %e, "Failed to complete run waitpoint");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops workers and releases every run lock this instance holds.
    ///
    /// Later calls return immediately.
    pub async fn quit(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down run engine");
        self.inner.shutdown_tx.send_replace(true);
        self.inner.locks.release_all().await;
    }
}

fn error_output(message: &str) -> Output {
    let body = serde_json::json!({ "message": message });
    Output::error(PayloadPacket::Inline {
        data: Bytes::from(body.to_string()),
        data_type: "application/json".to_string(),
    })
}
