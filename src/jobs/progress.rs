//! Metric snapshots and live progress fan-out.

use chrono::NaiveDateTime;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::config::ProgressConfig;
use crate::database::models::{
    job_status::JobStatus,
    metric_snapshot::{self, Entity as MetricSnapshotEntity},
    training_job,
};
use crate::jobs::executor::{AttemptTag, MetricSample};

/// Pushed to in-process subscribers whenever a job reports metrics or changes status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressUpdate {
    Metrics {
        job_id: Uuid,
        snapshot: metric_snapshot::Model,
    },
    Status {
        job_id: Uuid,
        attempt: i32,
        status: JobStatus,
    },
}

impl ProgressUpdate {
    pub const fn job_id(&self) -> Uuid {
        match self {
            Self::Metrics { job_id, .. } | Self::Status { job_id, .. } => *job_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub latest: Option<metric_snapshot::Model>,
    /// Last sign of life from the current attempt
    pub last_activity_at: Option<NaiveDateTime>,
    /// Running without any sign of life for longer than the staleness threshold
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    db: DatabaseConnection,
    updates: broadcast::Sender<ProgressUpdate>,
    staleness: chrono::Duration,
}

impl ProgressReporter {
    pub fn new(db: DatabaseConnection, config: &ProgressConfig) -> Self {
        let (updates, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            db,
            updates,
            staleness: i64::try_from(config.staleness_threshold_seconds)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Appends a snapshot for the attempt. Callers check the attempt is current.
    pub async fn record(
        &self,
        tag: AttemptTag,
        sample: MetricSample,
    ) -> Result<metric_snapshot::Model, DbErr> {
        let snapshot = metric_snapshot::ActiveModel {
            id: Set(Uuid::now_v7()),
            job_id: Set(tag.job_id),
            attempt: Set(tag.attempt),
            timestamp: Set(sample
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().naive_utc())),
            epoch: Set(sample.epoch),
            loss: Set(sample.loss),
            throughput: Set(sample.throughput),
            resource_utilization: Set(sample.resource_utilization),
        }
        .insert(&self.db)
        .await?;

        self.publish(ProgressUpdate::Metrics {
            job_id: tag.job_id,
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    pub fn publish_status(&self, job: &training_job::Model) {
        self.publish(ProgressUpdate::Status {
            job_id: job.id,
            attempt: job.attempt,
            status: job.status,
        });
    }

    fn publish(&self, update: ProgressUpdate) {
        // No subscribers is the common case
        if self.updates.send(update).is_err() {
            trace!("No progress subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.updates.subscribe()
    }

    /// The newest snapshot of the job, whichever attempt recorded it.
    pub async fn latest(&self, job_id: Uuid) -> Result<Option<metric_snapshot::Model>, DbErr> {
        MetricSnapshotEntity::find()
            .filter(metric_snapshot::Column::JobId.eq(job_id))
            .order_by_desc(metric_snapshot::Column::Timestamp)
            .order_by_desc(metric_snapshot::Column::Id)
            .one(&self.db)
            .await
    }

    pub async fn report(&self, job: &training_job::Model) -> Result<ProgressReport, DbErr> {
        self.report_at(job, chrono::Utc::now().naive_utc()).await
    }

    pub async fn report_at(
        &self,
        job: &training_job::Model,
        now: NaiveDateTime,
    ) -> Result<ProgressReport, DbErr> {
        let latest = self.latest(job.id).await?;
        // Snapshots of earlier attempts say nothing about the current one
        let last_activity_at = latest
            .as_ref()
            .filter(|snapshot| snapshot.attempt == job.attempt)
            .map(|snapshot| snapshot.timestamp)
            .or(job.started_at)
            .or(job.dispatched_at);
        let stale = job.status == JobStatus::Running
            && last_activity_at.is_some_and(|at| now - at > self.staleness);

        Ok(ProgressReport {
            latest,
            last_activity_at,
            stale,
        })
    }

    /// Every snapshot of the job across attempts, oldest first.
    pub async fn history(&self, job_id: Uuid) -> Result<Vec<metric_snapshot::Model>, DbErr> {
        MetricSnapshotEntity::find()
            .filter(metric_snapshot::Column::JobId.eq(job_id))
            .order_by_asc(metric_snapshot::Column::Timestamp)
            .order_by_asc(metric_snapshot::Column::Id)
            .all(&self.db)
            .await
    }
}
