//! API Module
//!
//! HTTP and WebSocket surface of the runner.

pub mod error;
pub mod health;
pub mod stream;
pub mod task;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::task::TaskRunner;

/// Shared state of all handlers
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<TaskRunner>,
    /// Cancelled on shutdown, ends every open stream
    pub shutdown: CancellationToken,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        // Step lifecycle
        .route("/task/run", post(task::run_task))
        .route("/task/abort", post(task::abort_task))
        .route("/task/pause", post(task::pause_task))
        .route("/task/unpause", post(task::unpause_task))
        // Streams
        .route("/task/status", get(stream::task_status))
        .route("/task/log/follow", get(stream::follow_log))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
