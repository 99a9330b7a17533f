//! runway run engine service.
//!
//! Serves the waitpoint, trigger and queue API and drives date-time
//! waitpoint completion.

use std::sync::Arc;

use anyhow::Result;
use runway_engine::{
    api,
    auth::StaticKeyAuthenticator,
    config,
    db::Database,
    engine::{EngineOptions, RunEngine},
    lock::MemoryLockService,
    payload::{ConditionalExporter, MemoryObjectStore},
    queue::MemoryQueueStore,
    repository::{MemoryRunRepository, RunRepository},
    state::AppState,
    worker::{DateTimeWaitpointWorker, DateTimeWorkerConfig},
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to RUNWAY_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting runway run engine");
    info!(listen_addr = %config.listen_addr, master_queue = %config.master_queue, "Configuration loaded");

    let (repository, db): (Arc<dyn RunRepository>, Option<Database>) =
        match config.database.database_url.as_deref() {
            Some(url) => {
                let db = match Database::connect(&config.database, url).await {
                    Ok(db) => db,
                    Err(e) => {
                        error!(error = %e, "Failed to connect to database");
                        return Err(e.into());
                    }
                };
                if config.dev_mode {
                    info!("Running database migrations (dev mode)");
                    if let Err(e) = db.run_migrations().await {
                        error!(error = %e, "Failed to run migrations");
                        return Err(e.into());
                    }
                }
                (Arc::new(db.run_repository()), Some(db))
            }
            None => {
                warn!("DATABASE_URL not set, runs are kept in memory");
                (Arc::new(MemoryRunRepository::new()), None)
            }
        };

    let engine = RunEngine::new(EngineOptions {
        repository,
        queue: Arc::new(MemoryQueueStore::new()),
        lock_service: Arc::new(MemoryLockService::new()),
        exporter: Arc::new(ConditionalExporter::new(
            Arc::new(MemoryObjectStore::new()),
            config.inline_threshold,
        )),
        machines: config.machines.clone(),
        lock: config.lock.clone(),
    })?;

    let authenticator: StaticKeyAuthenticator = config.api_keys.iter().cloned().collect();
    if authenticator.is_empty() {
        warn!("No API keys configured, every API request will be rejected");
    }

    let shutdown_rx = engine.shutdown_signal();

    let datetime_worker = DateTimeWaitpointWorker::new(
        engine.clone(),
        DateTimeWorkerConfig {
            interval: config.datetime_poll_interval,
            batch_size: config.datetime_batch_size,
        },
    );
    let datetime_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            datetime_worker.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(
        engine.clone(),
        Arc::new(authenticator),
        config.master_queue.clone(),
        db,
    );
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signals the server and workers, then releases held run locks
    engine.quit().await;

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, datetime_handle).await {
        warn!(error = %e, "Date-time waitpoint worker did not shut down in time");
    }

    info!("Run engine shutdown complete");
    Ok(())
}
