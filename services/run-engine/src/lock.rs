//! Run-scoped distributed locking.
//!
//! [`RunLockManager::with_lock`] serializes every state transition on a run.
//! The lock is a lease in a shared [`LockService`]: it expires on its own if
//! the holder dies. The operation is never cut off mid-flight. Instead it
//! receives a [`LockFence`] and checks it before each write; a write whose
//! lease has run out fails with [`EngineError::LockLost`] and the operation
//! compensates for whatever it already changed.
//!
//! Locks are not reentrant. Each acquisition gets a fresh token, so a second
//! operation on the same run waits even inside the same process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runway_id::{RunId, Ulid};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Error, Clone)]
pub enum LockError {
    #[error("lock backend unavailable: {0}")]
    Backend(String),
}

/// Exclusive lease with timeout over a shared lock store.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Takes `key` for `token` if it is free or its previous lease expired.
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Releases `key` if `token` still holds it. Returns false when the
    /// lease had already expired (and possibly been taken by someone else).
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;
}

/// Lock timing knobs.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How long a holder may keep the lock before it expires.
    pub lease_duration: Duration,
    /// Bound on waiting for a contended lock.
    pub acquire_timeout: Duration,
    /// Pause between acquisition attempts.
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(20),
        }
    }
}

/// Proof of a held lease, handed to the operation running under it.
///
/// The deadline is taken before the acquisition request, so it never
/// outlives the lease the lock service granted.
#[derive(Debug, Clone)]
pub struct LockFence {
    run_id: RunId,
    deadline: Instant,
}

impl LockFence {
    /// Fails with `LockLost` once the lease may have expired.
    pub fn check(&self) -> EngineResult<()> {
        if Instant::now() >= self.deadline {
            warn!(run_id = %self.run_id, "Run lock lease elapsed before write");
            return Err(EngineError::LockLost {
                run_id: self.run_id,
            });
        }
        Ok(())
    }

    /// Checks the fence, then performs `write`. The write is not started
    /// when the lease is gone.
    pub async fn commit<T, E, W>(&self, write: W) -> EngineResult<T>
    where
        W: Future<Output = Result<T, E>>,
        EngineError: From<E>,
    {
        self.check()?;
        Ok(write.await?)
    }
}

/// Serializes state-mutating operations per run.
#[derive(Clone)]
pub struct RunLockManager {
    service: Arc<dyn LockService>,
    config: LockConfig,
    held: Arc<Mutex<HashMap<String, String>>>,
    closed: Arc<AtomicBool>,
}

impl RunLockManager {
    pub fn new(service: Arc<dyn LockService>, config: LockConfig) -> Self {
        Self {
            service,
            config,
            held: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Runs `operation` while holding the run's lock.
    ///
    /// The lock is released on every exit path. `operation` is not called
    /// until the lock is held, and it always runs to completion: a lease
    /// that expires meanwhile only surfaces through the fence.
    pub async fn with_lock<T, F, Fut>(&self, run_id: &RunId, operation: F) -> EngineResult<T>
    where
        F: FnOnce(LockFence) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let key = lock_key(run_id);
        let token = Ulid::new().to_string();
        let fence = self.acquire(run_id, &key, &token).await?;

        let result = operation(fence).await;

        let released = self.service.release(&key, &token).await;
        self.held.lock().await.remove(&key);

        match released {
            Ok(true) => {}
            Ok(false) => {
                warn!(run_id = %run_id, "Run lock expired before release");
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to release run lock");
            }
        }
        result
    }

    async fn acquire(&self, run_id: &RunId, key: &str, token: &str) -> EngineResult<LockFence> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            let requested_at = Instant::now();
            if self
                .service
                .try_acquire(key, token, self.config.lease_duration)
                .await?
            {
                self.held
                    .lock()
                    .await
                    .insert(key.to_string(), token.to_string());
                return Ok(LockFence {
                    run_id: *run_id,
                    deadline: requested_at + self.config.lease_duration,
                });
            }

            if Instant::now() >= deadline {
                debug!(run_id = %run_id, "Run lock acquisition timed out");
                return Err(EngineError::LockTimeout { run_id: *run_id });
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Number of locks this instance currently holds.
    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }

    /// Refuses new acquisitions and releases every lock still held.
    pub async fn release_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let held: Vec<(String, String)> = self.held.lock().await.drain().collect();

        for (key, token) in held {
            if let Err(e) = self.service.release(&key, &token).await {
                warn!(lock_key = %key, error = %e, "Failed to release run lock on shutdown");
            }
        }
    }
}

pub(crate) fn lock_key(run_id: &RunId) -> String {
    format!("run-lock:{}", run_id.to_internal())
}

struct Lease {
    token: String,
    expires_at: Instant,
}

/// Process-local [`LockService`].
#[derive(Clone, Default)]
pub struct MemoryLockService {
    leases: Arc<RwLock<HashMap<String, Lease>>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired leases.
    pub async fn active_count(&self) -> usize {
        let now = Instant::now();
        self.leases
            .read()
            .await
            .values()
            .filter(|lease| lease.expires_at > now)
            .count()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.write().await;
        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now {
                return Ok(false);
            }
        }
        leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.write().await;
        match leases.get(key) {
            Some(lease) if lease.token == token => {
                let still_valid = lease.expires_at > now;
                leases.remove(key);
                Ok(still_valid)
            }
            _ => Ok(false),
        }
    }
}
