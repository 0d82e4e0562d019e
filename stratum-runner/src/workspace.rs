//! On-disk task workspaces and step artifacts
//!
//! Layout under the storage root:
//!
//! ```text
//! <envId>/<taskId>/               task workspace, mounted into every step
//!     latest-step.json            StepInfo of the most recent step
//!     control.json                Control Info (abort marker)
//!     step<N>/                    artifact directory of step N
//!         request.json  run.sh  output.log  info.json  container.json
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use stratum_core::domain::control::ControlInfo;
use stratum_core::domain::step::{StepInfo, step_dir_name};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Result, RunnerError};
use crate::runtime::ContainerState;

pub const REQUEST_FILE: &str = "request.json";
pub const SCRIPT_FILE: &str = "run.sh";
pub const LOG_FILE: &str = "output.log";
pub const STEP_INFO_FILE: &str = "info.json";
pub const SNAPSHOT_FILE: &str = "container.json";

pub const LATEST_STEP_FILE: &str = "latest-step.json";
pub const CONTROL_FILE: &str = "control.json";

pub const BACKEND_TF_FILE: &str = "_stratum.tf";
pub const PLAY_VARS_FILE: &str = "_stratum_play_vars.json";
pub const SSH_KEY_FILE: &str = "ssh_key";

pub const TF_STATE_JSON_FILE: &str = "tfstate.json";
pub const TF_PLAN_JSON_FILE: &str = "tfplan.json";
pub const SCAN_JSON_FILE: &str = "_tfscan.json";
pub const SCAN_RESULT_FILE: &str = "_tfresult.json";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Rejects ids that would escape the storage root
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(RunnerError::InvalidRequest(format!("{} is required", kind)));
    }
    if id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(RunnerError::InvalidRequest(format!(
            "invalid {} '{}'",
            kind, id
        )));
    }
    Ok(())
}

/// Storage root of all task workspaces
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn task_dir(&self, env_id: &str, task_id: &str) -> PathBuf {
        self.root.join(env_id).join(task_id)
    }

    pub fn step_dir(&self, env_id: &str, task_id: &str, step: i32) -> PathBuf {
        self.task_dir(env_id, task_id).join(step_dir_name(step))
    }

    pub fn log_path(&self, env_id: &str, task_id: &str, step: i32) -> PathBuf {
        self.step_dir(env_id, task_id, step).join(LOG_FILE)
    }

    pub async fn read_control(&self, env_id: &str, task_id: &str) -> Result<ControlInfo> {
        let path = self.task_dir(env_id, task_id).join(CONTROL_FILE);
        Ok(read_json(&path).await?.unwrap_or_else(|| ControlInfo {
            env_id: env_id.to_string(),
            task_id: task_id.to_string(),
            aborted_at: None,
        }))
    }

    /// Persists Control Info unless it already exists
    ///
    /// Returns `false` when a record was already present.
    pub async fn create_control(&self, info: &ControlInfo) -> Result<bool> {
        let dir = self.task_dir(&info.env_id, &info.task_id);
        fs::create_dir_all(&dir).await?;

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(CONTROL_FILE))
            .await;

        let mut file = match file {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        file.write_all(&serde_json::to_vec(info)?).await?;
        file.sync_all().await?;
        debug!(task_id = %info.task_id, "Control info written");
        Ok(true)
    }

    pub async fn read_latest_step(&self, env_id: &str, task_id: &str) -> Result<Option<StepInfo>> {
        read_json(&self.task_dir(env_id, task_id).join(LATEST_STEP_FILE)).await
    }

    pub async fn read_step_info(
        &self,
        env_id: &str,
        task_id: &str,
        step: i32,
    ) -> Result<Option<StepInfo>> {
        read_json(&self.step_dir(env_id, task_id, step).join(STEP_INFO_FILE)).await
    }

    /// Writes `info.json` of the step and refreshes `latest-step.json`
    pub async fn write_step_info(&self, info: &StepInfo) -> Result<()> {
        let data = serde_json::to_vec_pretty(info)?;
        fs::write(
            self.step_dir(&info.env_id, &info.task_id, info.step)
                .join(STEP_INFO_FILE),
            &data,
        )
        .await?;
        fs::write(
            self.task_dir(&info.env_id, &info.task_id)
                .join(LATEST_STEP_FILE),
            &data,
        )
        .await?;
        Ok(())
    }

    pub async fn read_snapshot(&self, step: &StepInfo) -> Result<Option<ContainerState>> {
        read_json(&self.snapshot_path(step)).await
    }

    /// Persists the terminal snapshot if none exists yet
    ///
    /// The file is staged under a unique temp name and hard-linked into
    /// place, so concurrent waiters never observe a partial file and the
    /// first writer wins. Returns `false` if another writer was first.
    pub async fn write_snapshot_once(&self, step: &StepInfo, state: &ContainerState) -> Result<bool> {
        let path = self.snapshot_path(step);
        let tmp = path.with_file_name(format!(
            ".{}.{}.{}",
            SNAPSHOT_FILE,
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops the snapshot of a previous attempt of the same step
    pub async fn remove_snapshot(&self, step_dir: &Path) -> Result<()> {
        match fs::remove_file(step_dir.join(SNAPSHOT_FILE)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads a file of the task workspace, missing files read as empty
    pub async fn read_task_file(&self, env_id: &str, task_id: &str, name: &str) -> Result<Vec<u8>> {
        read_or_empty(&self.task_dir(env_id, task_id).join(name)).await
    }

    pub async fn read_log(&self, env_id: &str, task_id: &str, step: i32) -> Result<Vec<u8>> {
        read_or_empty(&self.log_path(env_id, task_id, step)).await
    }

    fn snapshot_path(&self, step: &StepInfo) -> PathBuf {
        self.step_dir(&step.env_id, &step.task_id, step.step)
            .join(SNAPSHOT_FILE)
    }
}

/// Reads and decodes a JSON file, `None` if it does not exist
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_or_empty(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Serializes `value` as pretty JSON into `path`
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?).await?;
    Ok(())
}
