//! Dispatch of one candidate job and the wait task that follows it

use std::sync::Arc;
use std::time::Duration;
use stratum_core::domain::job::{Job, JobStatus};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::bus::{Admission, Bus, ExitNotifier};
use crate::error::{DispatchError, RunnerCallError};
use crate::runner::{JobRunner, StepOutcome};
use crate::store::JobStore;

/// Everything a wait task needs
#[derive(Clone)]
pub struct WaitContext {
    pub store: Arc<dyn JobStore>,
    pub runner: Arc<dyn JobRunner>,
    pub exited: ExitNotifier,
    /// Session token, cancelling it detaches every wait task
    pub cancel: CancellationToken,
    pub retry_interval: Duration,
    pub tasks: TaskTracker,
}

/// Admits, claims and starts one pending job
///
/// Every path that took a slot without handing the job to the launcher
/// gives the slot back through an exited event.
pub async fn dispatch(
    job: Job,
    store: &dyn JobStore,
    runner: &dyn JobRunner,
    bus: &Bus,
) -> Result<(), DispatchError> {
    match bus.starting(job.clone(), false).await? {
        Admission::Admitted => {}
        Admission::AtCapacity => return Err(DispatchError::AtCapacity(job.worker_id)),
        Admission::AlreadyTracked => return Err(DispatchError::AlreadyTracked(job.id)),
    }

    match store
        .update_status(&job.id, JobStatus::Pending, JobStatus::Assigning)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            bus.exited(&job.id).await;
            return Err(DispatchError::ClaimLost(job.id));
        }
        Err(e) => {
            bus.exited(&job.id).await;
            return Err(e.into());
        }
    }

    if let Err(e) = runner.start(&job).await {
        revert(store, &job).await;
        bus.exited(&job.id).await;
        return Err(e.into());
    }

    match store
        .update_status(&job.id, JobStatus::Assigning, JobStatus::Running)
        .await
    {
        Ok(true) => {}
        Ok(false) => warn!(job_id = %job.id, "Job left assigning while its step started"),
        Err(e) => error!(job_id = %job.id, "Failed to mark job running: {}", e),
    }

    bus.started(job, false).await
}

/// Puts a claimed job back to pending, unless it changed since
async fn revert(store: &dyn JobStore, job: &Job) {
    match store
        .update_status(&job.id, JobStatus::Assigning, JobStatus::Pending)
        .await
    {
        Ok(true) => debug!(job_id = %job.id, "Job reverted to pending"),
        Ok(false) => warn!(job_id = %job.id, "Job changed during dispatch, not reverted"),
        Err(e) => error!(job_id = %job.id, "Failed to revert job to pending: {}", e),
    }
}

/// Follows a running job until it exits, then records its terminal status
///
/// On session cancellation the job is only forgotten; its container keeps
/// running for the next session to reattach.
pub async fn wait_job(ctx: WaitContext, job: Job, recovered: bool) {
    let outcome = tokio::select! {
        _ = ctx.cancel.cancelled() => None,
        res = wait_with_retry(ctx.runner.as_ref(), &job, recovered, ctx.retry_interval) => Some(res),
    };

    match outcome {
        None => debug!(job_id = %job.id, "Detached from job"),
        Some(Ok(outcome)) => {
            let status = JobStatus::from_exit(outcome.exit_code, outcome.aborted);
            finish(ctx.store.as_ref(), &job, status, outcome.exit_code).await;
        }
        // Claimed by a session that ended before the step started
        Some(Err(e)) if recovered && job.status == JobStatus::Assigning && e.is_not_found() => {
            info!(job_id = %job.id, "Claimed job has no step, returning it to pending");
            revert(ctx.store.as_ref(), &job).await;
        }
        Some(Err(e)) => {
            error!(job_id = %job.id, "Cannot follow job: {}", e);
            finish(ctx.store.as_ref(), &job, JobStatus::Failed, -1).await;
        }
    }

    ctx.exited.exited(&job.id).await;
}

/// Calls the runner until it answers with anything but a transient error
async fn wait_with_retry(
    runner: &dyn JobRunner,
    job: &Job,
    recovered: bool,
    retry_interval: Duration,
) -> Result<StepOutcome, RunnerCallError> {
    loop {
        let res = if recovered {
            runner.attach(job).await
        } else {
            runner.wait(job).await
        };

        match res {
            Err(e) if e.is_transient() => {
                warn!(
                    job_id = %job.id,
                    "Waiting for job failed, retrying in {:?}: {}",
                    retry_interval, e
                );
                tokio::time::sleep(retry_interval).await;
            }
            other => return other,
        }
    }
}

/// Records the terminal status of a job that is running, or still
/// assigning when its running update never landed
async fn finish(store: &dyn JobStore, job: &Job, status: JobStatus, exit_code: i64) {
    for expected in [JobStatus::Running, JobStatus::Assigning] {
        match store.update_status(&job.id, expected, status).await {
            Ok(true) => {
                info!(job_id = %job.id, status = %status, exit_code, "Job finished");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(job_id = %job.id, "Failed to record terminal status: {}", e);
                return;
            }
        }
    }
    warn!(
        job_id = %job.id,
        status = %status,
        "Job is no longer active, terminal status dropped"
    );
}
