//! Podman CLI runtime
//!
//! Drives the `podman` binary (or any CLI compatible with it, such as
//! `docker`) through `tokio::process::Command`.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, RuntimeError, RuntimeResult};

/// Container runtime backed by the podman CLI
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    bin: String,
}

impl PodmanRuntime {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Checks that the CLI is installed and answers
    pub async fn check_available(&self) -> RuntimeResult<()> {
        let output = Command::new(&self.bin).arg("--version").output().await?;

        if !output.status.success() {
            return Err(RuntimeError::Failed(format!(
                "'{} --version' exited with {}",
                self.bin,
                output.status.code().unwrap_or(-1)
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!("Container runtime is available: {}", version.trim());
        Ok(())
    }

    /// Runs the CLI with `args` and maps a failed exit into a runtime error
    async fn run(&self, id: &str, args: &[&str]) -> RuntimeResult<Output> {
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            return Ok(output);
        }
        Err(classify_failure(id, args, &output))
    }
}

fn classify_failure(id: &str, args: &[&str], output: &Output) -> RuntimeError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_not_found_message(&stderr) {
        return RuntimeError::NotFound(id.to_string());
    }

    let msg = format!(
        "{} exited with {}: {}",
        args.first().copied().unwrap_or_default(),
        output.status.code().unwrap_or(-1),
        stderr.trim()
    );
    debug!("{}", msg);
    RuntimeError::Failed(msg)
}

/// podman: `no such container`, docker: `No such container: <id>`
fn is_not_found_message(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no container with name or id")
}

/// Arguments of `run -d` for a container spec
fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--init".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    if !spec.workdir.is_empty() {
        args.push("-w".to_string());
        args.push(spec.workdir.clone());
    }

    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.source, mount.target);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(volume);
    }

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    state: InspectState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectState {
    status: String,
    running: bool,
    paused: bool,
    #[serde(rename = "OOMKilled")]
    oom_killed: bool,
    exit_code: i64,
    started_at: Option<String>,
    finished_at: Option<String>,
}

/// Parses the JSON array printed by `inspect --format json`
fn parse_inspect(id: &str, stdout: &[u8]) -> RuntimeResult<ContainerState> {
    let entries: Vec<InspectEntry> = serde_json::from_slice(stdout)
        .map_err(|e| RuntimeError::Failed(format!("invalid inspect output: {}", e)))?;

    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

    Ok(ContainerState {
        id: entry.id,
        status: entry.state.status,
        running: entry.state.running,
        paused: entry.state.paused,
        exit_code: entry.state.exit_code,
        oom_killed: entry.state.oom_killed,
        started_at: entry.state.started_at,
        finished_at: entry.state.finished_at,
    })
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        info!(
            "Creating container {} with image {}",
            spec.name, spec.image
        );

        let args = create_args(spec);
        let output = Command::new(&self.bin)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("{} run stderr: {}", self.bin, stderr.trim());
        }

        if !output.status.success() {
            let error_msg = format!(
                "Failed to start container {}: exit_code={}, stderr='{}'",
                spec.name,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
            error!("{}", error_msg);
            return Err(RuntimeError::Failed(error_msg));
        }

        let container_id = stdout.trim().to_string();
        info!("Container {} started with ID: {}", spec.name, container_id);
        Ok(container_id)
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerState> {
        let output = self
            .run(id, &["inspect", "--type", "container", "--format", "json", id])
            .await?;
        parse_inspect(id, &output.stdout)
    }

    async fn wait(&self, id: &str, cancel: &CancellationToken) -> RuntimeResult<i64> {
        debug!("Waiting for container {}", id);

        let child = Command::new(&self.bin)
            .args(["wait", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // Dropping the future kills the `wait` process, never the container
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            output = child.wait_with_output() => output?,
        };

        if !output.status.success() {
            return Err(classify_failure(id, &["wait", id], &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let code = stdout
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse::<i64>()
            .map_err(|e| RuntimeError::Failed(format!("invalid wait output '{}': {}", stdout.trim(), e)))?;

        debug!("Container {} exited with {}", id, code);
        Ok(code)
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.run(id, &["rm", "-f", "-v", id]).await?;
        debug!("Container {} removed", id);
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> RuntimeResult<ExecOutput> {
        debug!("Executing in container {}: {:?}", id, cmd);

        let output = Command::new(&self.bin)
            .arg("exec")
            .arg(id)
            .args(cmd)
            .stdin(Stdio::null())
            .output()
            .await?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() && is_not_found_message(&stderr) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    async fn pause(&self, id: &str) -> RuntimeResult<()> {
        self.run(id, &["pause", id]).await?;
        info!("Container {} paused", id);
        Ok(())
    }

    async fn unpause(&self, id: &str) -> RuntimeResult<()> {
        self.run(id, &["unpause", id]).await?;
        info!("Container {} unpaused", id);
        Ok(())
    }

    async fn kill(&self, id: &str, signal: &str) -> RuntimeResult<()> {
        self.run(id, &["kill", "--signal", signal, id]).await?;
        info!("Sent SIG{} to container {}", signal, id);
        Ok(())
    }
}
