//! Model registry: one immutable artifact per successful training job.

use sea_orm::{
    sea_query::OnConflict, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::database::models::model_artifact::{self, Entity as ModelArtifactEntity};

#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub job_id: Uuid,
    pub user_id: String,
    pub dataset_id: Uuid,
    pub storage_location: String,
    pub quality_metrics: serde_json::Value,
}

/// Records the artifact produced by a job.
///
/// Recording twice for the same job is a no-op that returns the artifact
/// recorded first.
pub async fn record<C: ConnectionTrait>(
    db: &C,
    artifact: NewArtifact,
) -> Result<model_artifact::Model, DbErr> {
    let job_id = artifact.job_id;
    let model = model_artifact::ActiveModel {
        id: Set(Uuid::now_v7()),
        job_id: Set(artifact.job_id),
        user_id: Set(artifact.user_id),
        dataset_id: Set(artifact.dataset_id),
        storage_location: Set(artifact.storage_location),
        quality_metrics: Set(artifact.quality_metrics),
        created_at: Set(chrono::Utc::now().naive_utc()),
    };

    ModelArtifactEntity::insert(model)
        .on_conflict(
            OnConflict::column(model_artifact::Column::JobId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    find_for_job(db, job_id)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("model artifact for job {job_id}")))
}

pub async fn find<C: ConnectionTrait>(
    db: &C,
    artifact_id: Uuid,
) -> Result<Option<model_artifact::Model>, DbErr> {
    ModelArtifactEntity::find_by_id(artifact_id).one(db).await
}

pub async fn find_for_job<C: ConnectionTrait>(
    db: &C,
    job_id: Uuid,
) -> Result<Option<model_artifact::Model>, DbErr> {
    ModelArtifactEntity::find()
        .filter(model_artifact::Column::JobId.eq(job_id))
        .one(db)
        .await
}

pub async fn list_for_user(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<model_artifact::Model>, DbErr> {
    ModelArtifactEntity::find()
        .filter(model_artifact::Column::UserId.eq(user_id))
        .order_by_desc(model_artifact::Column::CreatedAt)
        .all(db)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::priority::Priority;
    use crate::tests::fixtures::queue_job;
    use crate::tests::setup_test::setup_app;

    #[tokio::test]
    async fn test_recording_is_idempotent_per_job() {
        let app = setup_app().await;
        let job = queue_job(&app.db, "user-1", Priority::Medium).await;
        let artifact = |location: &str| NewArtifact {
            job_id: job.id,
            user_id: job.user_id.clone(),
            dataset_id: job.dataset_id,
            storage_location: location.to_string(),
            quality_metrics: serde_json::json!({ "eval_loss": 0.42 }),
        };

        let first = record(&app.db, artifact("m-123")).await.unwrap();
        let second = record(&app.db, artifact("m-456")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.storage_location, "m-123");
        assert_eq!(list_for_user(&app.db, "user-1").await.unwrap(), vec![first.clone()]);
        assert_eq!(find(&app.db, first.id).await.unwrap(), Some(first));
    }
}
