//! Container runtime abstraction
//!
//! The runner only talks to containers through [`ContainerRuntime`]. The
//! production implementation drives the podman (or docker) CLI, tests use an
//! in-memory fake.

mod podman;

pub use podman::PodmanRuntime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors reported by a container runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The container does not exist (never created or already removed)
    #[error("container not found: {0}")]
    NotFound(String),

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    #[error("container runtime failed: {0}")]
    Failed(String),

    #[error("failed to run container runtime: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Bind mount of a host path into the container
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create and start a container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub workdir: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    /// Command run as the container's main process
    pub command: Vec<String>,
}

/// Container state as reported by the runtime
///
/// This is also the terminal snapshot persisted once the step exited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub id: String,
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub exit_code: i64,
    #[serde(default)]
    pub oom_killed: bool,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
}

/// Output of a command run inside a container
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Capability interface over a container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates and starts a container in the background
    ///
    /// # Arguments
    /// * `spec` - Name, image, mounts, environment and main command
    ///
    /// # Returns
    /// Container id
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerState>;

    /// Blocks until the container is no longer running, returns its exit code
    async fn wait(&self, id: &str, cancel: &CancellationToken) -> RuntimeResult<i64>;

    /// Force-removes the container and its anonymous volumes
    async fn remove(&self, id: &str) -> RuntimeResult<()>;

    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecOutput>;

    async fn pause(&self, id: &str) -> RuntimeResult<()>;

    async fn unpause(&self, id: &str) -> RuntimeResult<()>;

    /// Delivers a signal to the container's main process
    async fn kill(&self, id: &str, signal: &str) -> RuntimeResult<()>;
}
