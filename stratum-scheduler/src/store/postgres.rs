//! Postgres job store

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use stratum_core::domain::job::{Job, JobStatus};

use super::JobStore;
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn find_by_status(
        &self,
        status: JobStatus,
        exclude_workers: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        // LIMIT NULL means no limit
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, status, worker_id, created_at, assigned_at, request
            FROM jobs
            WHERE status = $1 AND NOT (worker_id = ANY($2))
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(status.as_str())
        .bind(exclude_workers)
        .bind(limit.map(|n| n as i64))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<bool, StoreError> {
        let assigned_at = (new == JobStatus::Assigning).then(chrono::Utc::now);

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1, assigned_at = COALESCE($2, assigned_at)
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(new.as_str())
        .bind(assigned_at)
        .bind(job_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_active_by_worker(&self) -> Result<HashMap<String, usize>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT worker_id, COUNT(*)
            FROM jobs
            WHERE status IN ($1, $2)
            GROUP BY worker_id
            "#,
        )
        .bind(JobStatus::Assigning.as_str())
        .bind(JobStatus::Running.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(worker, count)| (worker, count as usize))
            .collect())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    status: String,
    worker_id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    request: serde_json::Value,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row.status.parse::<JobStatus>().map_err(|reason| StoreError::Corrupt {
            id: row.id.clone(),
            reason,
        })?;

        let request = serde_json::from_value(row.request).map_err(|e| StoreError::Corrupt {
            id: row.id.clone(),
            reason: format!("invalid request: {}", e),
        })?;

        Ok(Job {
            id: row.id,
            status,
            worker_id: row.worker_id,
            created_at: row.created_at,
            assigned_at: row.assigned_at,
            request,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, request: serde_json::Value) -> JobRow {
        JobRow {
            id: "job-1".to_string(),
            status: status.to_string(),
            worker_id: "r1".to_string(),
            created_at: chrono::Utc::now(),
            assigned_at: None,
            request,
        }
    }

    #[test]
    fn test_row_into_job() {
        let job = Job::try_from(row(
            "running",
            serde_json::json!({ "taskId": "task-1", "stepType": "apply" }),
        ))
        .unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.request.task_id, "task-1");
    }

    #[test]
    fn test_corrupt_rows_are_rejected() {
        let bad_status = Job::try_from(row("queued", serde_json::json!({})));
        assert!(matches!(bad_status, Err(StoreError::Corrupt { .. })));

        let bad_request = Job::try_from(row("pending", serde_json::json!({ "taskId": 1 })));
        assert!(matches!(bad_request, Err(StoreError::Corrupt { .. })));
    }
}
