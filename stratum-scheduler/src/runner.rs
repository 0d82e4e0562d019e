//! Scheduler side of the execution runner
//!
//! `JobRunner` is what dispatch and the wait tasks call. `RemoteRunner`
//! talks to the runner service of each worker over HTTP/WebSocket.

use async_trait::async_trait;
use std::collections::HashMap;
use stratum_client::RunnerClient;
use stratum_core::domain::job::Job;
use stratum_core::dto::task::TaskStepQuery;
use tracing::{debug, info};

use crate::error::RunnerCallError;

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub exit_code: i64,
    /// The task was aborted while the step ran
    pub aborted: bool,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Starts the job's step, returns the container id
    async fn start(&self, job: &Job) -> Result<String, RunnerCallError>;

    /// Blocks until the job's step exited
    async fn wait(&self, job: &Job) -> Result<StepOutcome, RunnerCallError>;

    /// Reattaches to a step started by a previous scheduler session
    async fn attach(&self, job: &Job) -> Result<StepOutcome, RunnerCallError>;
}

/// Runner services addressed by worker id
pub struct RemoteRunner {
    clients: HashMap<String, RunnerClient>,
}

impl RemoteRunner {
    /// Creates clients from a worker id to base URL map
    pub fn new(workers: &HashMap<String, String>) -> Self {
        let clients = workers
            .iter()
            .map(|(id, url)| (id.clone(), RunnerClient::new(url.clone())))
            .collect();
        Self { clients }
    }

    fn client(&self, job: &Job) -> Result<&RunnerClient, RunnerCallError> {
        self.clients
            .get(&job.worker_id)
            .ok_or_else(|| RunnerCallError::UnknownWorker(job.worker_id.clone()))
    }
}

fn step_query(job: &Job) -> TaskStepQuery {
    TaskStepQuery {
        env_id: job.request.env.id.clone(),
        task_id: job.request.task_id.clone(),
        step: job.request.step,
    }
}

#[async_trait]
impl JobRunner for RemoteRunner {
    async fn start(&self, job: &Job) -> Result<String, RunnerCallError> {
        let client = self.client(job)?;
        let container_id = client.run_task(&job.request).await?;
        info!(
            job_id = %job.id,
            worker_id = %job.worker_id,
            container_id = %container_id,
            "Job step started"
        );
        Ok(container_id)
    }

    async fn wait(&self, job: &Job) -> Result<StepOutcome, RunnerCallError> {
        let client = self.client(job)?;
        let status = client.wait_task(&step_query(job)).await?;
        debug!(job_id = %job.id, exit_code = status.exit_code, "Job step exited");
        Ok(StepOutcome {
            exit_code: status.exit_code,
            aborted: status.aborted,
        })
    }

    async fn attach(&self, job: &Job) -> Result<StepOutcome, RunnerCallError> {
        info!(job_id = %job.id, worker_id = %job.worker_id, "Reattaching to running job");
        self.wait(job).await
    }
}
