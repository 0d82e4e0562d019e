//! Step lifecycle endpoints

use crate::RunnerClient;
use crate::error::Result;
use stratum_core::dto::task::{
    RunTaskRequest, RunTaskResponse, TaskAbortRequest, TaskAbortResponse, TaskStepQuery,
};

impl RunnerClient {
    /// Start a job step, returns the container id
    ///
    /// A 409 answer means the task was aborted and no new step may start.
    pub async fn run_task(&self, req: &RunTaskRequest) -> Result<String> {
        let url = format!("{}/task/run", self.base_url);
        let response = self.client.post(&url).json(req).send().await?;

        let resp: RunTaskResponse = self.handle_response(response).await?;
        tracing::debug!(
            task_id = %req.task_id,
            step = req.step,
            container_id = %resp.container_id,
            "Step started on runner"
        );
        Ok(resp.container_id)
    }

    /// Abort the latest step of a task
    ///
    /// With `just_check` set nothing changes on the runner, the response
    /// only tells whether an abort is currently possible.
    pub async fn abort_task(&self, req: &TaskAbortRequest) -> Result<TaskAbortResponse> {
        let url = format!("{}/task/abort", self.base_url);
        let response = self.client.post(&url).json(req).send().await?;

        self.handle_response(response).await
    }

    pub async fn pause_task(&self, query: &TaskStepQuery) -> Result<()> {
        let url = format!("{}/task/pause", self.base_url);
        let response = self.client.post(&url).json(query).send().await?;

        self.handle_empty_response(response).await
    }

    pub async fn unpause_task(&self, query: &TaskStepQuery) -> Result<()> {
        let url = format!("{}/task/unpause", self.base_url);
        let response = self.client.post(&url).json(query).send().await?;

        self.handle_empty_response(response).await
    }
}
