use stratum_client::ClientError;
use thiserror::Error;

/// Errors of the job store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row cannot be turned into a job
    #[error("corrupt job {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Errors of the lock service
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock transport error: {0}")]
    Transport(#[from] sqlx::Error),
}

/// Errors of the runner seen by the scheduler
#[derive(Debug, Error)]
pub enum RunnerCallError {
    #[error("no runner configured for worker '{0}'")]
    UnknownWorker(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl RunnerCallError {
    /// Whether the same call may succeed later
    pub fn is_transient(&self) -> bool {
        match self {
            RunnerCallError::UnknownWorker(_) => false,
            RunnerCallError::Client(e) => e.is_transient(),
        }
    }

    /// The runner has no such step
    pub fn is_not_found(&self) -> bool {
        matches!(self, RunnerCallError::Client(e) if e.is_not_found())
    }
}

/// Why a candidate job was not dispatched
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("worker {0} is at capacity")]
    AtCapacity(String),

    #[error("job {0} is already tracked")]
    AlreadyTracked(String),

    /// The guarded `pending -> assigning` update found another status
    #[error("job {0} was claimed by someone else")]
    ClaimLost(String),

    /// The session is shutting down and the bus no longer accepts events
    #[error("lifecycle bus closed")]
    BusClosed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("runner error: {0}")]
    Runner(#[from] RunnerCallError),
}

impl DispatchError {
    /// Normal outcomes of admission control, not worth more than a debug log
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            DispatchError::AtCapacity(_)
                | DispatchError::AlreadyTracked(_)
                | DispatchError::ClaimLost(_)
                | DispatchError::BusClosed
        )
    }
}
