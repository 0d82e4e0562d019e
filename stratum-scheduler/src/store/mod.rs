//! Job store
//!
//! The scheduler never creates or deletes jobs. It reads candidates by
//! status and moves them through their lifecycle with guarded updates, so
//! two processes racing on the same row can never both win.

mod postgres;
#[cfg(test)]
pub mod memory;

pub use postgres::PgJobStore;

use async_trait::async_trait;
use std::collections::HashMap;
use stratum_core::domain::job::{Job, JobStatus};

use crate::error::StoreError;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Jobs in `status` ordered by id, skipping jobs bound to `exclude_workers`
    ///
    /// `limit` of `None` returns every match.
    async fn find_by_status(
        &self,
        status: JobStatus,
        exclude_workers: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Moves a job from `expected` to `new`
    ///
    /// Returns `false` without writing when the job is no longer in
    /// `expected` (or does not exist).
    async fn update_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new: JobStatus,
    ) -> Result<bool, StoreError>;

    /// Number of assigning and running jobs per worker
    async fn count_active_by_worker(&self) -> Result<HashMap<String, usize>, StoreError>;
}
