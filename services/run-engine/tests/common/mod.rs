#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runway_engine::{
    lock::{LockConfig, MemoryLockService},
    machines::{MachineConfig, MachineResources},
    model::{Output, Run, RunSpec, Waitpoint},
    payload::{ConditionalExporter, IoPacket, MemoryObjectStore, DEFAULT_INLINE_THRESHOLD},
    queue::{DequeueRequest, MemoryQueueStore, QueueEntry, QueueError, QueueResult, QueueStore},
    repository::{MemoryRunRepository, RepositoryError, RepositoryResult, RunRepository},
    EngineOptions, RunEngine,
};
use runway_id::{EnvId, RunId, WaitpointId};

pub const MASTER_QUEUE: &str = "main";

pub fn engine() -> RunEngine {
    RunEngine::in_memory(MachineConfig::default(), LockConfig::default()).unwrap()
}

pub fn fast_lock_engine() -> RunEngine {
    RunEngine::in_memory(
        MachineConfig::default(),
        LockConfig {
            lease_duration: Duration::from_secs(2),
            acquire_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_millis(1),
        },
    )
    .unwrap()
}

pub fn run_spec(env_id: EnvId, machine: Option<&str>) -> RunSpec {
    RunSpec {
        friendly_id: RunId::new(),
        env_id,
        task_identifier: "reports/generate".to_string(),
        payload: IoPacket::new("{\"report\":1}", "application/json"),
        queue_name: "task/reports/generate".to_string(),
        master_queue: MASTER_QUEUE.to_string(),
        machine: machine.map(str::to_string),
        priority: None,
        is_test: false,
        parent: None,
    }
}

pub async fn trigger_many(engine: &RunEngine, env_id: EnvId, count: usize, machine: Option<&str>) -> Vec<Run> {
    let mut runs = Vec::with_capacity(count);
    for _ in 0..count {
        runs.push(engine.trigger(run_spec(env_id, machine)).await.unwrap());
    }
    runs
}

pub fn request(max_run_count: usize, max_resources: Option<(f64, f64)>) -> DequeueRequest {
    DequeueRequest {
        consumer_id: "worker-1".to_string(),
        master_queue: MASTER_QUEUE.to_string(),
        max_run_count,
        max_resources: max_resources.map(|(cpu, memory)| MachineResources::new(cpu, memory)),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("runway_engine=debug")
        .try_init();
}

/// Engine whose exporter offloads anything above `threshold` bytes into the
/// returned store.
pub fn offloading_engine(threshold: usize) -> (RunEngine, MemoryObjectStore) {
    let store = MemoryObjectStore::new();
    let engine = RunEngine::new(EngineOptions {
        repository: Arc::new(MemoryRunRepository::new()),
        queue: Arc::new(MemoryQueueStore::new()),
        lock_service: Arc::new(MemoryLockService::new()),
        exporter: Arc::new(ConditionalExporter::new(Arc::new(store.clone()), threshold)),
        machines: MachineConfig::default(),
        lock: LockConfig::default(),
    })
    .unwrap();
    (engine, store)
}

/// Engine over repository and queue doubles the test can slow down or break.
pub fn engine_over(repository: &FlakyRepository, queue: &FlakyQueue, lock: LockConfig) -> RunEngine {
    RunEngine::new(EngineOptions {
        repository: Arc::new(repository.clone()),
        queue: Arc::new(queue.clone()),
        lock_service: Arc::new(MemoryLockService::new()),
        exporter: Arc::new(ConditionalExporter::new(
            Arc::new(MemoryObjectStore::new()),
            DEFAULT_INLINE_THRESHOLD,
        )),
        machines: MachineConfig::default(),
        lock,
    })
    .unwrap()
}

/// In-memory repository with switchable failures and latency.
#[derive(Clone, Default)]
pub struct FlakyRepository {
    pub inner: MemoryRunRepository,
    fail_updates: Arc<AtomicBool>,
    update_delay_ms: Arc<AtomicU64>,
    read_delay_ms: Arc<AtomicU64>,
}

impl FlakyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn delay_updates(&self, delay: Duration) {
        self.update_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delays unscoped run reads, which every locked engine path starts with.
    pub fn delay_reads(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn pause(delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl RunRepository for FlakyRepository {
    async fn create_run(&self, run: &Run) -> RepositoryResult<()> {
        self.inner.create_run(run).await
    }

    async fn delete_run(&self, run_id: &RunId) -> RepositoryResult<()> {
        self.inner.delete_run(run_id).await
    }

    async fn find_run(&self, env_id: &EnvId, run_id: &RunId) -> RepositoryResult<Option<Run>> {
        self.inner.find_run(env_id, run_id).await
    }

    async fn get_run(&self, run_id: &RunId) -> RepositoryResult<Option<Run>> {
        Self::pause(&self.read_delay_ms).await;
        self.inner.get_run(run_id).await
    }

    async fn update_run(&self, run: &Run) -> RepositoryResult<()> {
        Self::pause(&self.update_delay_ms).await;
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RepositoryError::Corrupt {
                id: run.id.to_string(),
                message: "injected update failure".to_string(),
            });
        }
        self.inner.update_run(run).await
    }

    async fn create_waitpoint(&self, waitpoint: &Waitpoint) -> RepositoryResult<Waitpoint> {
        self.inner.create_waitpoint(waitpoint).await
    }

    async fn find_waitpoint(
        &self,
        env_id: &EnvId,
        waitpoint_id: &WaitpointId,
    ) -> RepositoryResult<Option<Waitpoint>> {
        self.inner.find_waitpoint(env_id, waitpoint_id).await
    }

    async fn find_waitpoint_by_idempotency_key(
        &self,
        env_id: &EnvId,
        idempotency_key: &str,
    ) -> RepositoryResult<Option<Waitpoint>> {
        self.inner
            .find_waitpoint_by_idempotency_key(env_id, idempotency_key)
            .await
    }

    async fn complete_waitpoint(
        &self,
        waitpoint_id: &WaitpointId,
        output: Option<&Output>,
        completed_at: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        self.inner
            .complete_waitpoint(waitpoint_id, output, completed_at)
            .await
    }

    async fn completion_waitpoints_for_run(
        &self,
        run_id: &RunId,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        self.inner.completion_waitpoints_for_run(run_id).await
    }

    async fn due_datetime_waitpoints(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        self.inner.due_datetime_waitpoints(now, limit).await
    }

    async fn completed_waitpoints_with_bindings(
        &self,
        limit: usize,
    ) -> RepositoryResult<Vec<Waitpoint>> {
        self.inner.completed_waitpoints_with_bindings(limit).await
    }

    async fn bind_run(&self, run_id: &RunId, waitpoint_id: &WaitpointId) -> RepositoryResult<()> {
        self.inner.bind_run(run_id, waitpoint_id).await
    }

    async fn unbind_run(
        &self,
        run_id: &RunId,
        waitpoint_id: &WaitpointId,
    ) -> RepositoryResult<()> {
        self.inner.unbind_run(run_id, waitpoint_id).await
    }

    async fn blocked_runs(&self, waitpoint_id: &WaitpointId) -> RepositoryResult<Vec<RunId>> {
        self.inner.blocked_runs(waitpoint_id).await
    }
}

/// In-memory queue store whose enqueue can be switched to fail.
#[derive(Clone, Default)]
pub struct FlakyQueue {
    pub inner: MemoryQueueStore,
    fail_enqueue: Arc<AtomicBool>,
}

impl FlakyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueStore for FlakyQueue {
    async fn next_sequence(&self, env_id: &EnvId) -> QueueResult<u64> {
        self.inner.next_sequence(env_id).await
    }

    async fn enqueue(&self, entry: QueueEntry) -> QueueResult<()> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(QueueError::Backend("injected enqueue failure".to_string()));
        }
        self.inner.enqueue(entry).await
    }

    async fn remove(&self, env_id: &EnvId, run_id: &RunId) -> QueueResult<bool> {
        self.inner.remove(env_id, run_id).await
    }

    async fn length(&self, env_id: &EnvId) -> QueueResult<usize> {
        self.inner.length(env_id).await
    }

    async fn peek(&self, env_id: &EnvId) -> QueueResult<Option<QueueEntry>> {
        self.inner.peek(env_id).await
    }

    async fn rotate_master(&self, master_queue: &str) -> QueueResult<Vec<EnvId>> {
        self.inner.rotate_master(master_queue).await
    }

    async fn master_members(&self, master_queue: &str) -> QueueResult<Vec<EnvId>> {
        self.inner.master_members(master_queue).await
    }
}
