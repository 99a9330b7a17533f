//! Background loops driven by the engine's shutdown signal.
//!
//! - [`DateTimeWaitpointWorker`] completes `DATE_TIME` waitpoints once their
//!   instant has passed, and retries runs a failed resume left bound to a
//!   completed waitpoint.
//! - [`DequeuePoller`] is the consumer side: it polls a master queue and
//!   forwards leased runs over a channel.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::engine::RunEngine;
use crate::machines::MachineResources;
use crate::model::LeasedRun;
use crate::queue::DequeueRequest;

#[derive(Debug, Clone)]
pub struct DateTimeWorkerConfig {
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for DateTimeWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

pub struct DateTimeWaitpointWorker {
    engine: RunEngine,
    config: DateTimeWorkerConfig,
}

impl DateTimeWaitpointWorker {
    pub fn new(engine: RunEngine, config: DateTimeWorkerConfig) -> Self {
        Self { engine, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting date-time waitpoint worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            if *shutdown.borrow() {
                info!("Date-time waitpoint worker shutting down");
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Date-time waitpoint worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One sweep. Returns the number of waitpoints completed.
    pub async fn tick(&self) -> usize {
        let waitpoints = self.engine.waitpoints();
        if let Err(e) = waitpoints.resume_stranded_runs(self.config.batch_size).await {
            warn!(error = %e, "Stranded binding sweep failed, retrying next tick");
        }

        match waitpoints
            .complete_due_datetime_waitpoints(Utc::now(), self.config.batch_size)
            .await
        {
            Ok(0) => 0,
            Ok(count) => {
                info!(completed = count, "Completed due date-time waitpoints");
                count
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Date-time sweep failed, retrying next tick");
                0
            }
            Err(e) => {
                error!(error = %e, "Date-time sweep failed");
                0
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DequeuePollerConfig {
    pub consumer_id: String,
    pub master_queue: String,
    pub interval: Duration,
    pub max_run_count: usize,
    pub max_resources: Option<MachineResources>,
}

/// Polls a master queue on a timer and forwards leases to `tx`.
pub struct DequeuePoller {
    engine: RunEngine,
    config: DequeuePollerConfig,
    tx: mpsc::Sender<LeasedRun>,
}

impl DequeuePoller {
    pub fn new(engine: RunEngine, config: DequeuePollerConfig, tx: mpsc::Sender<LeasedRun>) -> Self {
        Self { engine, config, tx }
    }

    #[instrument(skip(self, shutdown), fields(consumer_id = %self.config.consumer_id, master_queue = %self.config.master_queue))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_run_count = self.config.max_run_count,
            "Starting dequeue poller"
        );

        let request = DequeueRequest {
            consumer_id: self.config.consumer_id.clone(),
            master_queue: self.config.master_queue.clone(),
            max_run_count: self.config.max_run_count,
            max_resources: self.config.max_resources,
        };
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    if !self.poll_once(&request).await {
                        debug!("Lease receiver dropped");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Dequeue poller shutting down");
    }

    /// Returns false once the receiving side is gone.
    async fn poll_once(&self, request: &DequeueRequest) -> bool {
        let leased = match self.engine.dequeue_from_master_queue(request).await {
            Ok(leased) => leased,
            Err(e) => {
                warn!(error = %e, "Dequeue failed");
                return true;
            }
        };

        for run in leased {
            let run_id = run.run_id;
            if self.tx.send(run).await.is_err() {
                warn!(run_id = %run_id, "Leased run not delivered, receiver closed");
                return false;
            }
        }
        true
    }
}
