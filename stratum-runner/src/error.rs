use thiserror::Error;

use crate::runtime::RuntimeError;

/// Errors of the runner's task operations
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Control Info exists, no further step may start
    #[error("task {0} was aborted")]
    TaskAborted(String),

    #[error("task {0} is already aborted")]
    AlreadyAborted(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunnerError::Runtime(RuntimeError::Cancelled))
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
