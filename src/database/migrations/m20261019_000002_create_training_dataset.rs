use sea_orm_migration::{
    prelude::*,
    schema::{double, integer, json, string, timestamp, uuid},
};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TrainingDataset::Table)
                    .if_not_exists()
                    .col(uuid(TrainingDataset::Id).primary_key())
                    .col(string(TrainingDataset::UserId))
                    .col(integer(TrainingDataset::Version))
                    .col(string(TrainingDataset::ContentHash))
                    .col(json(TrainingDataset::Corpus))
                    .col(integer(TrainingDataset::AnswerCount))
                    .col(integer(TrainingDataset::CategoryCount))
                    .col(double(TrainingDataset::QualityScore))
                    .col(json(TrainingDataset::QualityReport))
                    .col(timestamp(TrainingDataset::CreatedAt).default(Expr::current_timestamp()))
                    .to_owned(),
            )
            .await?;

        // Identical corpora resolve to the same dataset record
        manager
            .create_index(
                Index::create()
                    .name("idx-training_dataset-user_id-content_hash")
                    .table(TrainingDataset::Table)
                    .col(TrainingDataset::UserId)
                    .col(TrainingDataset::ContentHash)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-training_dataset-user_id-version")
                    .table(TrainingDataset::Table)
                    .col(TrainingDataset::UserId)
                    .col(TrainingDataset::Version)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TrainingDataset::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(super) enum TrainingDataset {
    Table,
    Id,
    UserId,
    Version,
    ContentHash,
    Corpus,
    AnswerCount,
    CategoryCount,
    QualityScore,
    QualityReport,
    CreatedAt,
}
