//! Stratum Runner
//!
//! Executes job steps as isolated containers and exposes their lifecycle
//! over HTTP.
//!
//! Architecture:
//! - Configuration: `RUNNER_*` environment variables with defaults
//! - Runtime: container engine behind the `ContainerRuntime` trait (podman CLI)
//! - Workspace: on-disk task workspaces and step artifacts
//! - Task: start, status, wait, abort and pause of a step
//! - API: axum router with the request endpoints and the status/log streams
//!
//! The runner keeps no job state in memory; every call is resolved from the
//! step's files, so it can be restarted while steps keep running.

mod api;
mod config;
mod error;
mod follow;
mod runtime;
mod script;
mod task;
mod workspace;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::Config;
use crate::runtime::PodmanRuntime;
use crate::task::TaskRunner;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratum_runner=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Stratum Runner");

    let config = load_config()?;
    info!(
        "Loaded configuration: storage={}, image={}, runtime={}",
        config.storage_path.display(),
        config.default_image,
        config.container_bin
    );

    let runtime = PodmanRuntime::new(config.container_bin.clone());
    if let Err(e) = runtime.check_available().await {
        warn!("Container runtime check failed: {}", e);
    }

    let bind_addr = config.bind_addr;
    let runner = Arc::new(TaskRunner::new(Arc::new(config), Arc::new(runtime)));

    let shutdown = CancellationToken::new();
    let app = api::create_router(AppState {
        runner,
        shutdown: shutdown.clone(),
    });

    info!("Listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    info!("Runner stopped");
    Ok(())
}

/// Loads configuration from the environment, makes paths absolute and
/// creates the host directories mounted into step containers
fn load_config() -> Result<Config> {
    let mut config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;

    config.storage_path = std::path::absolute(&config.storage_path)
        .context("Failed to resolve storage path")?;
    config.plugin_cache_path = std::path::absolute(&config.plugin_cache_path)
        .context("Failed to resolve plugin cache path")?;
    if let Some(assets) = &config.assets_path {
        config.assets_path =
            Some(std::path::absolute(assets).context("Failed to resolve assets path")?);
    }

    std::fs::create_dir_all(&config.storage_path)
        .context("Failed to create storage directory")?;
    std::fs::create_dir_all(&config.plugin_cache_path)
        .context("Failed to create plugin cache directory")?;

    Ok(config)
}
