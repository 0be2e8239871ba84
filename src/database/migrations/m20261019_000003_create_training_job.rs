use sea_orm::DbBackend;
use sea_orm_migration::{
    prelude::*,
    schema::{
        big_integer, double, integer, json, json_null, string, string_null, timestamp,
        timestamp_null, uuid, uuid_null,
    },
};

use super::m20261019_000002_create_training_dataset::TrainingDataset;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TrainingJob::Table)
                    .if_not_exists()
                    .col(uuid(TrainingJob::Id).primary_key())
                    .col(timestamp(TrainingJob::CreatedAt).default(Expr::current_timestamp()))
                    .col(timestamp(TrainingJob::UpdatedAt).default(Expr::current_timestamp()))
                    .col(string(TrainingJob::UserId))
                    .col(integer(TrainingJob::Priority))
                    .col(string(TrainingJob::Status).default("queued"))
                    .col(string(TrainingJob::ResourceClass))
                    .col(uuid(TrainingJob::DatasetId))
                    .col(json(TrainingJob::Hyperparameters))
                    .col(integer(TrainingJob::Attempt).default(0))
                    .col(integer(TrainingJob::RetryCount).default(0))
                    .col(integer(TrainingJob::MaxRetries))
                    .col(timestamp_null(TrainingJob::DispatchedAt))
                    .col(timestamp_null(TrainingJob::StartedAt))
                    .col(timestamp_null(TrainingJob::CompletedAt))
                    .col(timestamp_null(TrainingJob::NextEligibleAt))
                    .col(timestamp_null(TrainingJob::CancelRequestedAt))
                    .col(json_null(TrainingJob::LastError))
                    .col(uuid_null(TrainingJob::ModelArtifactId))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-training_job-dataset_id")
                            .from(TrainingJob::Table, TrainingJob::DatasetId)
                            .to(TrainingDataset::Table, TrainingDataset::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        // Serves the claim query: status filter, then priority/created_at ordering
        manager
            .create_index(
                Index::create()
                    .name("idx-training_job-status-priority-created_at")
                    .table(TrainingJob::Table)
                    .col(TrainingJob::Status)
                    .col(TrainingJob::Priority)
                    .col(TrainingJob::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-training_job-user_id")
                    .table(TrainingJob::Table)
                    .col(TrainingJob::UserId)
                    .to_owned(),
            )
            .await?;

        // At most one non-terminal job per (user, dataset); both backends accept partial indexes
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS "idx-training_job-user_id-dataset_id-active"
                    ON training_job (user_id, dataset_id)
                    WHERE status IN ('queued', 'dispatched', 'running');
                "#,
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TrainingAttempt::Table)
                    .if_not_exists()
                    .col(uuid(TrainingAttempt::Id).primary_key())
                    .col(uuid(TrainingAttempt::JobId))
                    .col(integer(TrainingAttempt::Attempt))
                    .col(string(TrainingAttempt::Outcome))
                    .col(timestamp(TrainingAttempt::StartedAt))
                    .col(timestamp(TrainingAttempt::FinishedAt))
                    .col(big_integer(TrainingAttempt::DurationMs))
                    .col(string_null(TrainingAttempt::FailureReason))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-training_attempt-job_id")
                            .from(TrainingAttempt::Table, TrainingAttempt::JobId)
                            .to(TrainingJob::Table, TrainingJob::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-training_attempt-job_id")
                    .table(TrainingAttempt::Table)
                    .col(TrainingAttempt::JobId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TrainingMetricSnapshot::Table)
                    .if_not_exists()
                    .col(uuid(TrainingMetricSnapshot::Id).primary_key())
                    .col(uuid(TrainingMetricSnapshot::JobId))
                    .col(integer(TrainingMetricSnapshot::Attempt))
                    .col(timestamp(TrainingMetricSnapshot::Timestamp))
                    .col(integer(TrainingMetricSnapshot::Epoch))
                    .col(double(TrainingMetricSnapshot::Loss))
                    .col(double(TrainingMetricSnapshot::Throughput))
                    .col(double(TrainingMetricSnapshot::ResourceUtilization))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-training_metric_snapshot-job_id")
                            .from(TrainingMetricSnapshot::Table, TrainingMetricSnapshot::JobId)
                            .to(TrainingJob::Table, TrainingJob::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-training_metric_snapshot-job_id-timestamp")
                    .table(TrainingMetricSnapshot::Table)
                    .col(TrainingMetricSnapshot::JobId)
                    .col(TrainingMetricSnapshot::Timestamp)
                    .to_owned(),
            )
            .await?;

        if manager.get_database_backend() == DbBackend::Postgres {
            // Wakes the scheduler leader as soon as a job becomes claimable
            manager
                .get_connection()
                .execute_unprepared(
                    r"
                    CREATE OR REPLACE FUNCTION notify_training_job_queued()
                    RETURNS TRIGGER AS $$
                    BEGIN
                        IF NEW.status = 'queued' THEN
                            PERFORM pg_notify('training_job_queued', NEW.id::text);
                        END IF;
                        RETURN NEW;
                    END;
                    $$ LANGUAGE plpgsql;

                    CREATE TRIGGER training_job_queued_notify
                        AFTER INSERT OR UPDATE OF status ON training_job
                        FOR EACH ROW
                        EXECUTE FUNCTION notify_training_job_queued();
                    ",
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        if manager.get_database_backend() == DbBackend::Postgres {
            manager
                .get_connection()
                .execute_unprepared(
                    r"
                    DROP TRIGGER IF EXISTS training_job_queued_notify ON training_job;
                    DROP FUNCTION IF EXISTS notify_training_job_queued();
                    ",
                )
                .await?;
        }

        manager
            .drop_table(Table::drop().table(TrainingMetricSnapshot::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(TrainingAttempt::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(TrainingJob::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(super) enum TrainingJob {
    Table,
    Id,
    CreatedAt,
    UpdatedAt,
    UserId,
    Priority,
    Status,
    ResourceClass,
    DatasetId,
    Hyperparameters,
    Attempt,
    RetryCount,
    MaxRetries,
    DispatchedAt,
    StartedAt,
    CompletedAt,
    NextEligibleAt,
    CancelRequestedAt,
    LastError,
    ModelArtifactId,
}

#[derive(DeriveIden)]
enum TrainingAttempt {
    Table,
    Id,
    JobId,
    Attempt,
    Outcome,
    StartedAt,
    FinishedAt,
    DurationMs,
    FailureReason,
}

#[derive(DeriveIden)]
enum TrainingMetricSnapshot {
    Table,
    Id,
    JobId,
    Attempt,
    Timestamp,
    Epoch,
    Loss,
    Throughput,
    ResourceUtilization,
}
