use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::{
    coordinator::SubmitError,
    dataset::InsufficientDataError,
    deployment::DeploymentError,
    jobs::SchedulerError,
};

/// Errors surfaced by the HTTP handlers, rendered as `{"error", "message"}` bodies.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    InsufficientData(InsufficientDataError),
    #[error("{0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn job_not_found(job_id: Uuid) -> Self {
        Self::NotFound(format!("Training job {job_id} not found"))
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InsufficientData(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InsufficientData(_) => "insufficient_data",
            Self::Conflict(_) => "conflict",
            Self::Database(_) | Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            Self::InsufficientData(e) => json!({
                "error": self.code(),
                "message": e.to_string(),
                "failures": e.failures,
                "report": e.report,
            }),
            Self::Database(_) | Self::Internal(_) => {
                error!("❌ Request failed: {self}");
                // Internals stay in the log
                json!({
                    "error": self.code(),
                    "message": "Internal server error",
                })
            }
            _ => json!({
                "error": self.code(),
                "message": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::InsufficientData(e) => Self::InsufficientData(e),
            SubmitError::AlreadyQueued(_) => Self::Conflict(error.to_string()),
            SubmitError::Database(e) => Self::Database(e),
            SubmitError::Encoding(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(error: SchedulerError) -> Self {
        match error {
            SchedulerError::JobNotFound(job_id) => Self::job_not_found(job_id),
            SchedulerError::StaleResult(e) => Self::Conflict(e.to_string()),
            SchedulerError::Database(e) => Self::Database(e),
        }
    }
}

impl From<DeploymentError> for ApiError {
    fn from(error: DeploymentError) -> Self {
        match error {
            // Another user's artifact is reported as missing
            DeploymentError::ArtifactNotFound(artifact_id)
            | DeploymentError::ArtifactOwnerMismatch { artifact_id, .. } => {
                Self::NotFound(format!("Model artifact {artifact_id} not found"))
            }
            DeploymentError::Database(e) => Self::Database(e),
        }
    }
}
