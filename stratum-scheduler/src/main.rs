//! Stratum Scheduler
//!
//! Singleton control loop dispatching pending jobs to the runner of their
//! worker, under a per-worker concurrency limit.
//!
//! Architecture:
//! - Configuration: `SCHEDULER_*` environment variables with defaults
//! - Store: jobs table in Postgres, guarded status updates
//! - Lease: advisory lock electing the single active instance
//! - Scheduler: sessions, lifecycle bus, admission control and dispatch
//! - Runner: HTTP/WebSocket client of each worker's runner service

mod config;
mod db;
mod error;
mod lease;
mod runner;
mod scheduler;
mod store;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, LockBackend};
use crate::lease::{LockService, MemoryLockService, PgAdvisoryLock};
use crate::runner::RemoteRunner;
use crate::scheduler::Scheduler;
use crate::store::PgJobStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratum_scheduler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Stratum Scheduler");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    info!(
        "Loaded configuration: holder={}, workers={}, max_jobs_per_worker={}",
        config.holder_id,
        config.workers.len(),
        config.max_jobs_per_worker
    );

    info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let lock: Arc<dyn LockService> = match config.lock_backend {
        LockBackend::Postgres => Arc::new(PgAdvisoryLock::new(config.database_url.clone())),
        LockBackend::Memory => {
            info!("Using in-process lease, run a single scheduler instance only");
            Arc::new(MemoryLockService::new())
        }
    };
    let runner = Arc::new(RemoteRunner::new(&config.workers));
    let store = Arc::new(PgJobStore::new(pool));

    let shutdown = install_shutdown_handler()?;
    let scheduler = Arc::new(Scheduler::new(config, store, lock, runner));
    scheduler.run(shutdown).await;

    Ok(())
}

/// Cancels the returned token on SIGTERM or SIGINT
fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
        cancel.cancel();
    });

    Ok(token)
}
