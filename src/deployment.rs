//! Binds each user to the model artifact that serves their persona.

use chrono::NaiveDateTime;
use sea_orm::{sea_query::OnConflict, ConnectionTrait, DbErr, EntityTrait, Set};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::database::models::{
    active_deployment::{self, Entity as ActiveDeploymentEntity},
    model_artifact,
};
use crate::registry;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("Model artifact {0} not found")]
    ArtifactNotFound(Uuid),
    #[error("Model artifact {artifact_id} does not belong to user {user_id}")]
    ArtifactOwnerMismatch { artifact_id: Uuid, user_id: String },
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deployment {
    pub user_id: String,
    pub activated_at: NaiveDateTime,
    pub artifact: model_artifact::Model,
}

/// Makes `artifact_id` the active model for `user_id`, replacing any
/// previous binding. Concurrent activations leave exactly one binding.
pub async fn activate<C: ConnectionTrait>(
    db: &C,
    user_id: &str,
    artifact_id: Uuid,
) -> Result<Deployment, DeploymentError> {
    let artifact = registry::find(db, artifact_id)
        .await?
        .ok_or(DeploymentError::ArtifactNotFound(artifact_id))?;
    if artifact.user_id != user_id {
        return Err(DeploymentError::ArtifactOwnerMismatch {
            artifact_id,
            user_id: user_id.to_string(),
        });
    }

    let activated_at = chrono::Utc::now().naive_utc();
    ActiveDeploymentEntity::insert(active_deployment::ActiveModel {
        user_id: Set(user_id.to_string()),
        model_artifact_id: Set(artifact_id),
        activated_at: Set(activated_at),
    })
    .on_conflict(
        OnConflict::column(active_deployment::Column::UserId)
            .update_columns([
                active_deployment::Column::ModelArtifactId,
                active_deployment::Column::ActivatedAt,
            ])
            .to_owned(),
    )
    .exec_without_returning(db)
    .await?;

    info!("🚀 Activated model {artifact_id} for user {user_id}");

    Ok(Deployment {
        user_id: user_id.to_string(),
        activated_at,
        artifact,
    })
}

pub async fn get_active<C: ConnectionTrait>(
    db: &C,
    user_id: &str,
) -> Result<Option<Deployment>, DbErr> {
    let found = ActiveDeploymentEntity::find_by_id(user_id.to_string())
        .find_also_related(model_artifact::Entity)
        .one(db)
        .await?;

    Ok(found.and_then(|(binding, artifact)| {
        artifact.map(|artifact| Deployment {
            user_id: binding.user_id,
            activated_at: binding.activated_at,
            artifact,
        })
    }))
}
