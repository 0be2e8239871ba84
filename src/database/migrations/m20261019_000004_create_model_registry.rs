use sea_orm_migration::{
    prelude::*,
    schema::{json, string, timestamp, uuid},
};

use super::{
    m20261019_000002_create_training_dataset::TrainingDataset,
    m20261019_000003_create_training_job::TrainingJob,
};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ModelArtifact::Table)
                    .if_not_exists()
                    .col(uuid(ModelArtifact::Id).primary_key())
                    .col(uuid(ModelArtifact::JobId).unique_key())
                    .col(string(ModelArtifact::UserId))
                    .col(uuid(ModelArtifact::DatasetId))
                    .col(string(ModelArtifact::StorageLocation))
                    .col(json(ModelArtifact::QualityMetrics))
                    .col(timestamp(ModelArtifact::CreatedAt).default(Expr::current_timestamp()))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-model_artifact-job_id")
                            .from(ModelArtifact::Table, ModelArtifact::JobId)
                            .to(TrainingJob::Table, TrainingJob::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-model_artifact-dataset_id")
                            .from(ModelArtifact::Table, ModelArtifact::DatasetId)
                            .to(TrainingDataset::Table, TrainingDataset::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-model_artifact-user_id")
                    .table(ModelArtifact::Table)
                    .col(ModelArtifact::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ActiveDeployment::Table)
                    .if_not_exists()
                    .col(string(ActiveDeployment::UserId).primary_key())
                    .col(uuid(ActiveDeployment::ModelArtifactId))
                    .col(timestamp(ActiveDeployment::ActivatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-active_deployment-model_artifact_id")
                            .from(ActiveDeployment::Table, ActiveDeployment::ModelArtifactId)
                            .to(ModelArtifact::Table, ModelArtifact::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ActiveDeployment::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(ModelArtifact::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ModelArtifact {
    Table,
    Id,
    JobId,
    UserId,
    DatasetId,
    StorageLocation,
    QualityMetrics,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ActiveDeployment {
    Table,
    UserId,
    ModelArtifactId,
    ActivatedAt,
}
