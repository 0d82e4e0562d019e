//! Step lifecycle on top of the container runtime
//!
//! Every step is one container whose main process runs the step script. The
//! runner keeps no state in memory: each operation is resolved from the
//! step's `info.json` and terminal snapshot, so any number of status/log
//! streams and waiters can attach to the same step.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use stratum_core::domain::control::ControlInfo;
use stratum_core::domain::step::{COLLECT_STEP_INDEX, StepInfo};
use stratum_core::dto::task::{
    RunTaskRequest, TaskAbortRequest, TaskAbortResponse, TaskStatusMessage, TaskStepQuery,
};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, parse_bool};
use crate::error::{Result, RunnerError};
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState, Mount, RuntimeError};
use crate::script::{self, CONTAINER_ASSETS_DIR, CONTAINER_PLUGIN_CACHE_DIR, CONTAINER_WORKSPACE};
use crate::workspace::{
    self, BACKEND_TF_FILE, LOG_FILE, PLAY_VARS_FILE, REQUEST_FILE, SCAN_JSON_FILE,
    SCAN_RESULT_FILE, SCRIPT_FILE, SSH_KEY_FILE, Storage, TF_PLAN_JSON_FILE, TF_STATE_JSON_FILE,
};

/// Signal delivered to the step process on abort
const ABORT_SIGNAL: &str = "TERM";
/// Signal delivered once the step outlived its timeout
const TIMEOUT_SIGNAL: &str = "KILL";
/// Time an aborted step gets to exit before it is killed
const ABORT_GRACE: Duration = Duration::from_secs(30);
/// Upper bound for the force-unlock container
const UNLOCK_TIMEOUT: Duration = Duration::from_secs(120);

pub struct TaskRunner {
    config: Arc<Config>,
    storage: Storage,
    runtime: Arc<dyn ContainerRuntime>,
}

/// Name of the container of a step
pub fn container_name(task_id: &str, step: i32) -> String {
    if step == COLLECT_STEP_INDEX {
        format!("stratum-{}-collect", task_id)
    } else {
        format!("stratum-{}-step{}", task_id, step)
    }
}

/// Name of the one-shot container that force-unlocks the state of a step
pub fn unlock_container_name(task_id: &str, step: i32) -> String {
    format!("{}-unlock", container_name(task_id, step))
}

impl TaskRunner {
    /// Creates a task runner
    ///
    /// # Arguments
    /// * `config` - Runner configuration, its storage path holds all task workspaces
    /// * `runtime` - Container engine the steps run on
    pub fn new(config: Arc<Config>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let storage = Storage::new(config.storage_path.clone());
        Self {
            config,
            storage,
            runtime,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a step in a new container
    ///
    /// Step 0 also prepares the task workspace. A retried step replaces the
    /// previous attempt's container and snapshot.
    ///
    /// # Arguments
    /// * `req` - Step request, refused once the task was aborted unless it is
    ///   the collect step
    ///
    /// # Returns
    /// Container id
    pub async fn start(&self, req: RunTaskRequest) -> Result<String> {
        validate_request(&req)?;
        let env_id = req.env.id.as_str();
        let task_id = req.task_id.as_str();

        if req.step >= 0 && self.storage.read_control(env_id, task_id).await?.aborted() {
            return Err(RunnerError::TaskAborted(task_id.to_string()));
        }

        let task_dir = self.storage.task_dir(env_id, task_id);
        fs::create_dir_all(&task_dir).await?;
        if req.step == 0 {
            self.prepare_workspace(&req).await?;
        }

        let step_dir = self.storage.step_dir(env_id, task_id, req.step);
        fs::create_dir_all(&step_dir).await?;
        // a retried step must not see the previous attempt's exit
        self.storage.remove_snapshot(&step_dir).await?;

        workspace::write_json(&step_dir.join(REQUEST_FILE), &req.redacted()).await?;
        fs::write(step_dir.join(SCRIPT_FILE), script::step_script(&req)).await?;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(step_dir.join(LOG_FILE))
            .await?;

        let name = container_name(task_id, req.step);
        match self.runtime.remove(&name).await {
            Ok(()) => debug!(container = %name, "Removed leftover container"),
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!(container = %name, "Failed to remove leftover container: {}", e),
        }

        let spec = self.container_spec(&req, name, &task_dir);
        info!(
            task_id = %task_id,
            step = req.step,
            step_type = %req.step_type,
            image = %spec.image,
            "Starting step"
        );
        let container_id = self.runtime.create(&spec).await?;

        let step = StepInfo {
            env_id: env_id.to_string(),
            task_id: task_id.to_string(),
            step: req.step,
            container_id: container_id.clone(),
            workdir: req.env.workdir.clone(),
            state_path: req.state_store.path.clone(),
            started_at: Utc::now(),
            timeout: req.timeout,
        };
        self.storage.write_step_info(&step).await?;

        Ok(container_id)
    }

    async fn prepare_workspace(&self, req: &RunTaskRequest) -> Result<()> {
        let task_dir = self.storage.task_dir(&req.env.id, &req.task_id);

        let key = format!("{}\n", req.private_key.trim());
        write_private(&task_dir.join(SSH_KEY_FILE), key.as_bytes()).await?;

        fs::write(
            task_dir.join(BACKEND_TF_FILE),
            script::backend_tf(req, &self.config.state_address),
        )
        .await?;
        fs::write(task_dir.join(PLAY_VARS_FILE), script::play_vars(req)?).await?;
        Ok(())
    }

    fn container_spec(
        &self,
        req: &RunTaskRequest,
        name: String,
        task_dir: &std::path::Path,
    ) -> ContainerSpec {
        let image = if req.docker_image.is_empty() {
            self.config.default_image.clone()
        } else {
            req.docker_image.clone()
        };

        let mut mounts = vec![
            Mount {
                source: task_dir.display().to_string(),
                target: CONTAINER_WORKSPACE.to_string(),
                read_only: false,
            },
            Mount {
                source: self.config.plugin_cache_path.display().to_string(),
                target: CONTAINER_PLUGIN_CACHE_DIR.to_string(),
                read_only: false,
            },
        ];
        if let Some(assets) = &self.config.assets_path {
            mounts.push(Mount {
                source: assets.display().to_string(),
                target: CONTAINER_ASSETS_DIR.to_string(),
                read_only: true,
            });
        }

        ContainerSpec {
            name,
            image,
            workdir: CONTAINER_WORKSPACE.to_string(),
            env: script::container_env(req),
            mounts,
            command: script::container_command(req),
        }
    }

    fn reserve_container(&self, req_env: Option<&String>) -> bool {
        req_env
            .and_then(|v| parse_bool(v))
            .unwrap_or(self.config.reserve_container)
    }

    /// Resolves a started step, `StepNotFound` if it never started
    pub async fn load_step(&self, query: &TaskStepQuery) -> Result<StepInfo> {
        workspace::validate_id("envId", &query.env_id)?;
        workspace::validate_id("taskId", &query.task_id)?;

        self.storage
            .read_step_info(&query.env_id, &query.task_id, query.step)
            .await?
            .ok_or_else(|| {
                RunnerError::StepNotFound(format!(
                    "{}/{}/step {}",
                    query.env_id, query.task_id, query.step
                ))
            })
    }

    /// Current container state, the terminal snapshot once it exists
    pub async fn status(&self, step: &StepInfo) -> Result<ContainerState> {
        if let Some(snapshot) = self.storage.read_snapshot(step).await? {
            return Ok(snapshot);
        }

        match self.runtime.inspect(&step.container_id).await {
            Ok(state) => Ok(state),
            // removed between the two reads by a concurrent waiter
            Err(RuntimeError::NotFound(id)) => self
                .storage
                .read_snapshot(step)
                .await?
                .ok_or(RunnerError::Runtime(RuntimeError::NotFound(id))),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until the step exited and returns its exit code
    ///
    /// The first waiter to see the exit persists the terminal snapshot and
    /// removes the container. A container that no longer exists counts as
    /// exited with code 0 unless a snapshot says otherwise.
    ///
    /// # Arguments
    /// * `step` - Started step to wait for
    /// * `cancel` - Stops waiting without touching the container
    ///
    /// # Returns
    /// Exit code of the step's main process
    pub async fn wait(&self, step: &StepInfo, cancel: &CancellationToken) -> Result<i64> {
        if let Some(snapshot) = self.storage.read_snapshot(step).await? {
            return Ok(snapshot.exit_code);
        }

        let exit_code = match self.wait_with_deadline(step, cancel).await {
            Ok(code) => code,
            Err(RuntimeError::NotFound(_)) => return self.snapshot_exit_code(step).await,
            Err(e) => return Err(e.into()),
        };

        let state = match self.runtime.inspect(&step.container_id).await {
            Ok(state) => state,
            Err(RuntimeError::NotFound(_)) => return self.snapshot_exit_code(step).await,
            Err(e) => {
                warn!(task_id = %step.task_id, "Failed to inspect exited container: {}", e);
                ContainerState {
                    id: step.container_id.clone(),
                    status: "exited".to_string(),
                    exit_code,
                    ..Default::default()
                }
            }
        };

        match self.storage.write_snapshot_once(step, &state).await {
            Ok(true) => debug!(task_id = %step.task_id, step = step.step, "Snapshot written"),
            Ok(false) => {}
            Err(e) => warn!(task_id = %step.task_id, "Failed to write snapshot: {}", e),
        }

        let req_env = self.request_env_flag(step).await;
        if !self.reserve_container(req_env.as_ref()) {
            match self.runtime.remove(&step.container_id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => warn!(task_id = %step.task_id, "Failed to remove container: {}", e),
            }
        }

        info!(
            task_id = %step.task_id,
            step = step.step,
            exit_code = state.exit_code,
            "Step exited"
        );
        Ok(state.exit_code)
    }

    async fn snapshot_exit_code(&self, step: &StepInfo) -> Result<i64> {
        Ok(self
            .storage
            .read_snapshot(step)
            .await?
            .map(|s| s.exit_code)
            .unwrap_or(0))
    }

    /// Per-request override of the reserve flag, read from `request.json`
    async fn request_env_flag(&self, step: &StepInfo) -> Option<String> {
        let req = self.read_request(step).await.ok()??;
        req.env
            .environment_vars
            .get(script::RESERVE_CONTAINER_VAR)
            .cloned()
    }

    /// The redacted request the step was started with
    async fn read_request(&self, step: &StepInfo) -> Result<Option<RunTaskRequest>> {
        let path = self
            .storage
            .step_dir(&step.env_id, &step.task_id, step.step)
            .join(REQUEST_FILE);
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_with_deadline(
        &self,
        step: &StepInfo,
        cancel: &CancellationToken,
    ) -> std::result::Result<i64, RuntimeError> {
        if step.timeout == 0 {
            return self.runtime.wait(&step.container_id, cancel).await;
        }

        let deadline = step.started_at + chrono::Duration::seconds(step.timeout as i64);
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            res = self.runtime.wait(&step.container_id, cancel) => res,
            _ = tokio::time::sleep(remaining) => {
                warn!(
                    task_id = %step.task_id,
                    step = step.step,
                    timeout = step.timeout,
                    "Step timed out, killing container"
                );
                self.runtime.kill(&step.container_id, TIMEOUT_SIGNAL).await?;
                self.runtime.wait(&step.container_id, cancel).await
            }
        }
    }

    /// Whether Control Info marks the task as aborted
    pub async fn is_aborted(&self, env_id: &str, task_id: &str) -> Result<bool> {
        Ok(self.storage.read_control(env_id, task_id).await?.aborted())
    }

    /// Aborts the latest step of a task, or only reports whether it could
    ///
    /// Marks the task aborted, stops the step and force-unlocks its state.
    /// Fails with `StepNotFound` when no step was started yet and with
    /// `AlreadyAborted` on the second abort.
    ///
    /// # Arguments
    /// * `req` - Task to abort; with `just_check` nothing is changed
    ///
    /// # Returns
    /// Whether the task can be, and has been, aborted
    pub async fn abort(&self, req: &TaskAbortRequest) -> Result<TaskAbortResponse> {
        workspace::validate_id("envId", &req.env_id)?;
        workspace::validate_id("taskId", &req.task_id)?;

        let control = self.storage.read_control(&req.env_id, &req.task_id).await?;
        let latest = self
            .storage
            .read_latest_step(&req.env_id, &req.task_id)
            .await?;

        let latest = match latest {
            Some(step) if step.is_abortable() => step,
            other => {
                let reason = match &other {
                    Some(step) => format!("step {} cannot be aborted", step.step),
                    None => "task has no started step".to_string(),
                };
                if req.just_check {
                    return Ok(TaskAbortResponse {
                        can_abort: false,
                        aborted: control.aborted(),
                        reason: Some(reason),
                    });
                }
                return Err(match other {
                    Some(_) => RunnerError::InvalidRequest(reason),
                    None => RunnerError::StepNotFound(format!(
                        "{}/{}: {}",
                        req.env_id, req.task_id, reason
                    )),
                });
            }
        };

        if control.aborted() {
            if req.just_check {
                return Ok(TaskAbortResponse {
                    can_abort: false,
                    aborted: true,
                    reason: Some("task is already aborted".to_string()),
                });
            }
            return Err(RunnerError::AlreadyAborted(req.task_id.clone()));
        }

        let step = self
            .load_step(&TaskStepQuery {
                env_id: req.env_id.clone(),
                task_id: req.task_id.clone(),
                step: latest.step,
            })
            .await?;

        if req.just_check {
            return Ok(TaskAbortResponse {
                can_abort: true,
                aborted: false,
                reason: None,
            });
        }

        let info = ControlInfo {
            env_id: req.env_id.clone(),
            task_id: req.task_id.clone(),
            aborted_at: Some(Utc::now()),
        };
        if !self.storage.create_control(&info).await? {
            return Err(RunnerError::AlreadyAborted(req.task_id.clone()));
        }
        info!(task_id = %req.task_id, step = step.step, "Task aborted");

        self.stop_step(&step).await?;

        Ok(TaskAbortResponse {
            can_abort: true,
            aborted: true,
            reason: None,
        })
    }

    /// Stops the step and releases a possibly held state lock
    ///
    /// The step container stops with its main process, so the unlock runs
    /// in a one-shot container over the same workspace once the step exited.
    async fn stop_step(&self, step: &StepInfo) -> Result<()> {
        let id = &step.container_id;

        let state = match self.runtime.inspect(id).await {
            Ok(state) => state,
            Err(RuntimeError::NotFound(_)) => {
                debug!(task_id = %step.task_id, "Container already gone, nothing to stop");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if state.running || state.paused {
            if state.paused {
                self.runtime.unpause(id).await?;
            }
            match self.runtime.kill(id, ABORT_SIGNAL).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            self.wait_stopped(step).await?;
        }

        match self.force_unlock(step).await {
            Ok(code) => info!(task_id = %step.task_id, exit_code = code, "force-unlock finished"),
            Err(e) => warn!(task_id = %step.task_id, "force-unlock failed: {}", e),
        }
        Ok(())
    }

    /// Waits for a signalled step to exit, killing it after the grace period
    async fn wait_stopped(&self, step: &StepInfo) -> Result<()> {
        let id = &step.container_id;
        let cancel = CancellationToken::new();

        let res = match tokio::time::timeout(ABORT_GRACE, self.runtime.wait(id, &cancel)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(task_id = %step.task_id, "Step ignored the abort signal, killing it");
                match self.runtime.kill(id, TIMEOUT_SIGNAL).await {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.runtime.wait(id, &cancel).await
            }
        };

        match res {
            Ok(_) | Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs the unlock script of the step's state and returns its exit code
    async fn force_unlock(&self, step: &StepInfo) -> Result<i64> {
        let req = self.read_request(step).await?.ok_or_else(|| {
            RunnerError::StepNotFound(format!("{}/step {} request", step.task_id, step.step))
        })?;

        let task_dir = self.storage.task_dir(&step.env_id, &step.task_id);
        let mut spec = self.container_spec(
            &req,
            unlock_container_name(&step.task_id, step.step),
            &task_dir,
        );
        spec.command = script::unlock_command(&req);

        // left over from an earlier abort of the same step
        match self.runtime.remove(&spec.name).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let id = self.runtime.create(&spec).await?;
        let cancel = CancellationToken::new();
        let res = tokio::time::timeout(UNLOCK_TIMEOUT, self.runtime.wait(&id, &cancel)).await;

        match self.runtime.remove(&id).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => warn!(container = %id, "Failed to remove unlock container: {}", e),
        }

        match res {
            Ok(code) => Ok(code?),
            Err(_) => Err(RuntimeError::Failed(format!(
                "force-unlock did not finish within {:?}",
                UNLOCK_TIMEOUT
            ))
            .into()),
        }
    }

    pub async fn pause(&self, query: &TaskStepQuery) -> Result<()> {
        let step = self.load_step(query).await?;
        self.runtime.pause(&step.container_id).await?;
        Ok(())
    }

    pub async fn unpause(&self, query: &TaskStepQuery) -> Result<()> {
        let step = self.load_step(query).await?;
        self.runtime.unpause(&step.container_id).await?;
        Ok(())
    }

    /// Final status message of an exited step, with all artifacts
    pub async fn final_status(&self, step: &StepInfo, exit_code: i64) -> Result<TaskStatusMessage> {
        let (env_id, task_id) = (step.env_id.as_str(), step.task_id.as_str());
        Ok(TaskStatusMessage {
            exited: true,
            exit_code,
            aborted: self.is_aborted(env_id, task_id).await?,
            log_content: self.storage.read_log(env_id, task_id, step.step).await?,
            tf_state_json: self
                .storage
                .read_task_file(env_id, task_id, TF_STATE_JSON_FILE)
                .await?,
            tf_plan_json: self
                .storage
                .read_task_file(env_id, task_id, TF_PLAN_JSON_FILE)
                .await?,
            scan_json: self
                .storage
                .read_task_file(env_id, task_id, SCAN_JSON_FILE)
                .await?,
            result_json: self
                .storage
                .read_task_file(env_id, task_id, SCAN_RESULT_FILE)
                .await?,
        })
    }
}

fn validate_request(req: &RunTaskRequest) -> Result<()> {
    workspace::validate_id("taskId", &req.task_id)?;
    workspace::validate_id("envId", &req.env.id)?;
    if req.step < COLLECT_STEP_INDEX {
        return Err(RunnerError::InvalidRequest(format!(
            "invalid step index {}",
            req.step
        )));
    }
    let workdir = req.env.workdir.as_str();
    if workdir.starts_with('/') || workdir.split('/').any(|c| c == "..") {
        return Err(RunnerError::InvalidRequest(format!(
            "invalid workdir '{}'",
            workdir
        )));
    }
    Ok(())
}

#[cfg(unix)]
async fn write_private(path: &std::path::Path, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, data).await?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_private(path: &std::path::Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).await?;
    Ok(())
}
