//! Job step types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Step index used by the implicit state-collection step
///
/// Negative indices are implicit steps: they are not abortable and run even
/// after an abort request.
pub const COLLECT_STEP_INDEX: i32 = -1;

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Checkout,
    Init,
    Plan,
    Apply,
    Destroy,
    Play,
    Command,
    Collect,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepType::Checkout => "checkout",
            StepType::Init => "init",
            StepType::Plan => "plan",
            StepType::Apply => "apply",
            StepType::Destroy => "destroy",
            StepType::Play => "play",
            StepType::Command => "command",
            StepType::Collect => "collect",
        };
        f.write_str(name)
    }
}

/// Record of a started step
///
/// Written by the runner once the step's container is running. It is the
/// handle every later status, wait and abort call is resolved from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInfo {
    pub env_id: String,
    pub task_id: String,
    pub step: i32,
    pub container_id: String,
    /// Working directory inside the checked out code
    pub workdir: String,
    /// State path on the backend, used to force-unlock on abort
    pub state_path: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Step timeout in seconds, 0 means none
    #[serde(default)]
    pub timeout: u64,
}

impl StepInfo {
    /// Whether the step can be the target of an abort request
    pub fn is_abortable(&self) -> bool {
        self.step >= 0
    }
}

/// Name of the artifact directory of a step inside the task workspace
pub fn step_dir_name(step: i32) -> String {
    if step == COLLECT_STEP_INDEX {
        ".step-collect".to_string()
    } else {
        format!("step{}", step)
    }
}
