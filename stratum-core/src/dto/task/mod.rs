//! Task DTOs for scheduler/runner communication

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::step::StepType;

/// Environment the step runs against
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskEnv {
    pub id: String,
    pub workdir: String,
    pub tf_vars_file: String,
    pub playbook: String,
    pub play_vars_file: String,
    pub tf_version: String,
    pub environment_vars: HashMap<String, String>,
    pub terraform_vars: HashMap<String, String>,
    pub ansible_vars: HashMap<String, String>,
}

/// Terraform state backend settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateStore {
    pub backend: String,
    pub scheme: String,
    pub path: String,
    /// Backend address, filled in by the runner when empty
    pub address: String,
}

/// Request descriptor of one job step
///
/// Body of `POST /task/run`. A copy is stored in the step's artifact
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    #[serde(default)]
    pub env: TaskEnv,
    pub task_id: String,
    #[serde(default)]
    pub step: i32,
    pub step_type: StepType,
    #[serde(default)]
    pub step_args: Vec<String>,
    #[serde(default)]
    pub docker_image: String,
    #[serde(default)]
    pub state_store: StateStore,
    #[serde(default)]
    pub repo_address: String,
    #[serde(default)]
    pub repo_commit_id: String,
    /// Variables injected by the platform, they win over user variables
    #[serde(default)]
    pub sys_environments: HashMap<String, String>,
    /// Step timeout in seconds, 0 means none
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub private_key: String,
}

impl RunTaskRequest {
    /// Copy of the request that is safe to persist
    pub fn redacted(&self) -> Self {
        let mut req = self.clone();
        if !req.private_key.is_empty() {
            req.private_key = "******".to_string();
        }
        req
    }
}

/// Response of `POST /task/run`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskResponse {
    pub container_id: String,
}

/// Query addressing one step: `?envId&taskId&step`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStepQuery {
    pub env_id: String,
    pub task_id: String,
    #[serde(default)]
    pub step: i32,
}

/// Body of `POST /task/abort`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAbortRequest {
    pub env_id: String,
    pub task_id: String,
    /// Only report whether the task can be aborted, change nothing
    #[serde(default)]
    pub just_check: bool,
}

/// Response of `POST /task/abort`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAbortResponse {
    pub can_abort: bool,
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Message pushed over the status stream
///
/// Artifacts are only populated in the final message sent once the step
/// exited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskStatusMessage {
    pub exited: bool,
    pub exit_code: i64,
    pub aborted: bool,
    pub log_content: Vec<u8>,
    pub tf_state_json: Vec<u8>,
    pub tf_plan_json: Vec<u8>,
    pub scan_json: Vec<u8>,
    pub result_json: Vec<u8>,
}
