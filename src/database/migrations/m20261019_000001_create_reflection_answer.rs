use sea_orm_migration::{
    prelude::*,
    schema::{integer, string, text, timestamp, uuid},
};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ReflectionAnswer::Table)
                    .if_not_exists()
                    .col(uuid(ReflectionAnswer::Id).primary_key())
                    .col(string(ReflectionAnswer::UserId))
                    .col(string(ReflectionAnswer::QuestionCategory))
                    .col(text(ReflectionAnswer::Text))
                    .col(integer(ReflectionAnswer::WordCount).default(0))
                    .col(timestamp(ReflectionAnswer::CreatedAt).default(Expr::current_timestamp()))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-reflection_answer-user_id")
                    .table(ReflectionAnswer::Table)
                    .col(ReflectionAnswer::UserId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ReflectionAnswer::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ReflectionAnswer {
    Table,
    Id,
    UserId,
    QuestionCategory,
    Text,
    WordCount,
    CreatedAt,
}
