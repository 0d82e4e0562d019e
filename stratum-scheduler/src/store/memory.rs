//! In-memory job store for tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use stratum_core::domain::job::{Job, JobStatus};
use stratum_core::domain::step::StepType;
use stratum_core::dto::task::{RunTaskRequest, TaskEnv};
use tokio::sync::Mutex;

use super::JobStore;
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<Mutex<BTreeMap<String, Job>>>,
}

impl MemoryJobStore {
    pub async fn insert(&self, job: Job) {
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    pub async fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.lock().await.get(job_id).map(|j| j.status)
    }

    /// Overwrites the status as an external actor would
    pub async fn set_status(&self, job_id: &str, status: JobStatus) {
        if let Some(job) = self.jobs.lock().await.get_mut(job_id) {
            job.status = status;
        }
    }
}

/// A job bound to `worker` with a minimal apply request
pub fn job(id: &str, worker: &str, status: JobStatus) -> Job {
    Job {
        id: id.to_string(),
        status,
        worker_id: worker.to_string(),
        created_at: chrono::Utc::now(),
        assigned_at: None,
        request: RunTaskRequest {
            env: TaskEnv {
                id: "env-1".to_string(),
                ..Default::default()
            },
            task_id: format!("task-{}", id),
            step: 0,
            step_type: StepType::Apply,
            step_args: Vec::new(),
            docker_image: String::new(),
            state_store: Default::default(),
            repo_address: String::new(),
            repo_commit_id: String::new(),
            sys_environments: HashMap::new(),
            timeout: 0,
            private_key: String::new(),
        },
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn find_by_status(
        &self,
        status: JobStatus,
        exclude_workers: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|j| j.status == status && !exclude_workers.contains(&j.worker_id))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(job_id) {
            Some(job) if job.status == expected => {
                job.status = new;
                if new == JobStatus::Assigning {
                    job.assigned_at = Some(chrono::Utc::now());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_active_by_worker(&self) -> Result<HashMap<String, usize>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut counts = HashMap::new();
        for job in jobs.values() {
            if matches!(job.status, JobStatus::Assigning | JobStatus::Running) {
                *counts.entry(job.worker_id.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_orders_by_id_and_excludes_workers() {
        let store = MemoryJobStore::default();
        store.insert(job("j3", "r1", JobStatus::Pending)).await;
        store.insert(job("j1", "r2", JobStatus::Pending)).await;
        store.insert(job("j2", "r1", JobStatus::Pending)).await;
        store.insert(job("j0", "r1", JobStatus::Running)).await;

        let ids = |jobs: Vec<Job>| jobs.into_iter().map(|j| j.id).collect::<Vec<_>>();

        let all = store.find_by_status(JobStatus::Pending, &[], None).await.unwrap();
        assert_eq!(ids(all), ["j1", "j2", "j3"]);

        let limited = store
            .find_by_status(JobStatus::Pending, &[], Some(2))
            .await
            .unwrap();
        assert_eq!(ids(limited), ["j1", "j2"]);

        let excluded = store
            .find_by_status(JobStatus::Pending, &["r1".to_string()], None)
            .await
            .unwrap();
        assert_eq!(ids(excluded), ["j1"]);
    }

    #[tokio::test]
    async fn test_guarded_update() {
        let store = MemoryJobStore::default();
        store.insert(job("j1", "r1", JobStatus::Pending)).await;

        assert!(
            store
                .update_status("j1", JobStatus::Pending, JobStatus::Assigning)
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_status("j1", JobStatus::Pending, JobStatus::Assigning)
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_status("missing", JobStatus::Pending, JobStatus::Assigning)
                .await
                .unwrap()
        );

        let counts = store.count_active_by_worker().await.unwrap();
        assert_eq!(counts.get("r1"), Some(&1));
    }
}
