//! `SeaORM` Entity for training jobs

use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::database::models::{
    job_status::JobStatus, priority::Priority, resource_class::ResourceClass,
};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "training_job")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub created_at: DateTime,
    pub updated_at: DateTime,
    pub user_id: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub resource_class: ResourceClass,
    pub dataset_id: Uuid,
    #[sea_orm(column_type = "Json")]
    pub hyperparameters: Json,
    /// Fencing token, bumped on every claim. Executor events must echo it.
    pub attempt: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub dispatched_at: Option<DateTime>,
    pub started_at: Option<DateTime>,
    pub completed_at: Option<DateTime>,
    pub next_eligible_at: Option<DateTime>,
    pub cancel_requested_at: Option<DateTime>,
    #[sea_orm(column_type = "Json", nullable)]
    pub last_error: Option<FailureRecord>,
    pub model_artifact_id: Option<Uuid>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::training_attempt::Entity")]
    TrainingAttempt,
    #[sea_orm(has_many = "super::metric_snapshot::Entity")]
    MetricSnapshot,
}

impl Related<super::training_attempt::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TrainingAttempt.def()
    }
}

impl Related<super::metric_snapshot::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MetricSnapshot.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Structured cause of a failed attempt, kept on the job once retries run out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The executor reported a training failure (divergence, OOM, bad data).
    Execution,
    /// No terminal signal within the allowed running window.
    Timeout,
}

impl Model {
    /// The `(job, attempt)` pair executor events for the current attempt must carry.
    pub const fn attempt_tag(&self) -> crate::jobs::executor::AttemptTag {
        crate::jobs::executor::AttemptTag {
            job_id: self.id,
            attempt: self.attempt,
        }
    }

    /// Check if the job can be retried after the current attempt fails
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Check if the retry backoff has elapsed
    #[must_use]
    pub fn is_ready_for_dispatch(&self, now: DateTime) -> bool {
        self.status == JobStatus::Queued
            && self
                .next_eligible_at
                .is_none_or(|next_eligible_at| now >= next_eligible_at)
    }

    pub const fn cancel_pending(&self) -> bool {
        self.cancel_requested_at.is_some() && self.status.is_active()
    }
}
