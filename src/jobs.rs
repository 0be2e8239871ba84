//! Training-job lifecycle: queue storage, scheduling, executor contract and
//! progress reporting.

pub(crate) mod advisory_lock;
pub mod executor;
pub mod progress;
pub mod scheduler;
pub mod store;
pub mod supervisor;

use thiserror::Error;

use crate::database::models::job_status::JobStatus;
use executor::AttemptTag;

/// The executor could not take the job. The job goes back to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("executor unavailable: {0}")]
    Unavailable(String),
    #[error("executor rejected the job: {0}")]
    Rejected(String),
}

/// A signal for an attempt the job has already moved past.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stale result for {tag}: job is at attempt {current_attempt} with status {status}")]
pub struct StaleResultError {
    pub tag: AttemptTag,
    pub current_attempt: i32,
    pub status: JobStatus,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Training job {0} not found")]
    JobNotFound(uuid::Uuid),
    #[error(transparent)]
    StaleResult(#[from] StaleResultError),
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}
