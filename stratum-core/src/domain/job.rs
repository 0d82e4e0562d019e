//! Job domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::dto::task::RunTaskRequest;

/// Job record
///
/// Owned by the job store. The scheduler keeps a copy only while the job is
/// tracked as active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// Worker (runner node) the job is bound to
    pub worker_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Step request sent to the runner when the job is dispatched
    pub request: RunTaskRequest,
}

/// Job lifecycle status
///
/// `Pending → Assigning → Running → {Complete, Failed}`, plus `Aborted`
/// reachable from `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Assigning,
    Running,
    Complete,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Assigning => "assigning",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }

    /// Whether the job can no longer change status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Aborted
        )
    }

    /// Terminal status for a finished step
    pub fn from_exit(exit_code: i64, aborted: bool) -> Self {
        if aborted {
            JobStatus::Aborted
        } else if exit_code == 0 {
            JobStatus::Complete
        } else {
            JobStatus::Failed
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "assigning" => Ok(JobStatus::Assigning),
            "running" => Ok(JobStatus::Running),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Assigning,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Failed,
            JobStatus::Aborted,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Assigning.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_status_from_exit() {
        assert_eq!(JobStatus::from_exit(0, false), JobStatus::Complete);
        assert_eq!(JobStatus::from_exit(2, false), JobStatus::Failed);
        assert_eq!(JobStatus::from_exit(0, true), JobStatus::Aborted);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Assigning).unwrap();
        assert_eq!(json, "\"assigning\"");
    }
}
