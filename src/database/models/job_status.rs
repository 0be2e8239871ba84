use sea_orm::DeriveActiveEnum;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Lifecycle state of a training job.
///
/// # State Transitions
///
/// Typical lifecycle:
/// - `Queued` → `Dispatched` → `Running` → `Succeeded`
/// - `Running` → `Failed` → `Queued` (automatic retry while retries remain)
/// - `Dispatched` → `Queued` (executor rejected or never acknowledged the start)
/// - `Queued` | `Dispatched` | `Running` → `Cancelled`
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[derive(Default)]
pub enum JobStatus {
    /// Waiting for capacity. Eligible once `next_eligible_at` has passed.
    #[sea_orm(string_value = "queued")]
    #[default]
    Queued,

    /// Claimed by the scheduler and handed to the executor, start not yet acknowledged.
    ///
    /// Counts against the concurrency limits so an accepted-but-not-started job
    /// cannot be double booked.
    #[sea_orm(string_value = "dispatched")]
    Dispatched,

    /// The executor acknowledged the start and is training.
    #[sea_orm(string_value = "running")]
    Running,

    /// Terminal. A model artifact was recorded for the job.
    #[sea_orm(string_value = "succeeded")]
    Succeeded,

    /// Terminal once retries are exhausted; `last_error` holds the final cause.
    #[sea_orm(string_value = "failed")]
    Failed,

    /// Terminal. Late results from the cancelled attempt are discarded.
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl JobStatus {
    /// Statuses for which a job still occupies its `(user, dataset)` slot.
    pub const NON_TERMINAL: [Self; 3] = [Self::Queued, Self::Dispatched, Self::Running];

    /// Statuses that count against the concurrency limits.
    pub const ACTIVE: [Self; 2] = [Self::Dispatched, Self::Running];

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }
}
