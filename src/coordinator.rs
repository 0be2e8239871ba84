//! Public operations of the training coordinator.
//!
//! Everything a caller (the HTTP layer, an admin tool) may do goes through
//! these functions. The caller is trusted to pass an authenticated user id.

use chrono::NaiveDateTime;
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::{
    app::App,
    config::TrainingConfig,
    database::models::{
        job_status::JobStatus, metric_snapshot, model_artifact, priority::Priority,
        resource_class::ResourceClass, training_attempt, training_job,
    },
    dataset::{self, AssembleError, InsufficientDataError},
    deployment::{self, Deployment, DeploymentError},
    jobs::{
        scheduler::CancelAck,
        store::{self, Enqueued, NewTrainingJob},
        SchedulerError,
    },
    registry,
};

/// Per-submission tweaks merged over the configured training defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct HyperparameterOverrides {
    #[validate(range(min = 1, max = 50))]
    pub epochs: Option<u32>,
    #[validate(range(min = 0.000_001, max = 0.01))]
    pub learning_rate: Option<f64>,
    #[validate(range(min = 1, max = 256))]
    pub lora_rank: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct SubmitOptions {
    pub priority: Option<Priority>,
    pub resource_class: Option<ResourceClass>,
    #[validate(nested)]
    #[serde(default)]
    pub hyperparameters: HyperparameterOverrides,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    InsufficientData(#[from] InsufficientDataError),
    #[error("Training job {} is already queued for this dataset", .0.id)]
    AlreadyQueued(Box<training_job::Model>),
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Failed to encode training data: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<AssembleError> for SubmitError {
    fn from(error: AssembleError) -> Self {
        match error {
            AssembleError::InsufficientData(e) => Self::InsufficientData(e),
            AssembleError::Database(e) => Self::Database(e),
            AssembleError::Encoding(e) => Self::Encoding(e),
        }
    }
}

/// A job together with its live progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: training_job::Model,
    pub latest_snapshot: Option<metric_snapshot::Model>,
    pub stale: bool,
    pub last_activity_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHistory {
    pub job_id: Uuid,
    pub snapshots: Vec<metric_snapshot::Model>,
    pub attempts: Vec<training_attempt::Model>,
}

fn merge_hyperparameters(
    defaults: &TrainingConfig,
    overrides: &HyperparameterOverrides,
) -> serde_json::Value {
    json!({
        "base_model": defaults.base_model,
        "epochs": overrides.epochs.unwrap_or(defaults.epochs),
        "learning_rate": overrides.learning_rate.unwrap_or(defaults.learning_rate),
        "lora_rank": overrides.lora_rank.unwrap_or(defaults.lora_rank),
    })
}

/// Assembles the user's corpus and queues a training job for it.
///
/// Returns once the job is durably queued; training happens in the
/// background. Submitting again while a job for the same corpus is still
/// open yields [`SubmitError::AlreadyQueued`] carrying that job.
pub async fn submit_training_job(
    app: &App,
    user_id: &str,
    options: SubmitOptions,
) -> Result<training_job::Model, SubmitError> {
    let assembled =
        dataset::assemble(&app.db, app.answers.as_ref(), user_id, &app.config.dataset).await?;

    let new_job = NewTrainingJob {
        user_id: user_id.to_string(),
        dataset_id: assembled.dataset.id,
        priority: options.priority.unwrap_or_default(),
        resource_class: options
            .resource_class
            .unwrap_or(app.config.training.resource_class),
        hyperparameters: merge_hyperparameters(&app.config.training, &options.hyperparameters),
        max_retries: app.config.scheduler.max_retries,
    };

    match store::enqueue(&app.db, new_job).await? {
        Enqueued::Created(job) => {
            info!(
                "📥 Queued training job {} for user {} (priority {}, dataset v{})",
                job.id, user_id, job.priority, assembled.dataset.version
            );
            app.wake_scheduler();
            Ok(job)
        }
        Enqueued::AlreadyQueued(job) => Err(SubmitError::AlreadyQueued(Box::new(job))),
    }
}

pub async fn get_job_status(app: &App, job_id: Uuid) -> Result<Option<JobStatusView>, DbErr> {
    let Some(job) = store::find(&app.db, job_id).await? else {
        return Ok(None);
    };

    let report = app.progress.report(&job).await?;
    Ok(Some(JobStatusView {
        job,
        latest_snapshot: report.latest,
        stale: report.stale,
        last_activity_at: report.last_activity_at,
    }))
}

/// Cancels the job. A queued job is cancelled at once; an in-flight job is
/// cancelled once the executor confirms or the confirmation window passes.
pub async fn cancel_job(app: &App, job_id: Uuid) -> Result<CancelAck, SchedulerError> {
    app.scheduler().cancel(job_id).await
}

pub async fn list_jobs(
    app: &App,
    user_id: &str,
    status: Option<JobStatus>,
) -> Result<Vec<training_job::Model>, DbErr> {
    store::list_for_user(&app.db, user_id, status).await
}

pub async fn get_active_model(
    app: &App,
    user_id: &str,
) -> Result<Option<model_artifact::Model>, DbErr> {
    Ok(deployment::get_active(&app.db, user_id)
        .await?
        .map(|deployment| deployment.artifact))
}

/// Binds one of the user's recorded artifacts, e.g. to roll back to an older model.
pub async fn activate_model(
    app: &App,
    user_id: &str,
    artifact_id: Uuid,
) -> Result<Deployment, DeploymentError> {
    deployment::activate(&app.db, user_id, artifact_id).await
}

pub async fn list_models(app: &App, user_id: &str) -> Result<Vec<model_artifact::Model>, DbErr> {
    registry::list_for_user(&app.db, user_id).await
}

pub async fn job_history(app: &App, job_id: Uuid) -> Result<Option<JobHistory>, DbErr> {
    if store::find(&app.db, job_id).await?.is_none() {
        return Ok(None);
    }

    Ok(Some(JobHistory {
        job_id,
        snapshots: app.progress.history(job_id).await?,
        attempts: store::attempts(&app.db, job_id).await?,
    }))
}
