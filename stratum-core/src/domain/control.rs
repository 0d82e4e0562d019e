//! Task control records

use serde::{Deserialize, Serialize};

/// Persisted abort marker of a task
///
/// Once written it is never rewritten: a second abort request for the same
/// task is a conflict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlInfo {
    pub env_id: String,
    pub task_id: String,
    pub aborted_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ControlInfo {
    pub fn aborted(&self) -> bool {
        self.aborted_at.is_some()
    }
}
