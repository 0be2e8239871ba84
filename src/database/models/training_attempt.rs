//! `SeaORM` Entity for per-attempt execution history

use crate::database::models::attempt_outcome::AttemptOutcome;
use sea_orm::entity::prelude::*;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "training_attempt")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub job_id: Uuid,
    pub attempt: i32,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime,
    pub finished_at: DateTime,
    pub duration_ms: i64,
    pub failure_reason: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::training_job::Entity",
        from = "Column::JobId",
        to = "super::training_job::Column::Id"
    )]
    TrainingJob,
}

impl Related<super::training_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TrainingJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub const fn duration(&self) -> chrono::Duration {
        self.finished_at.signed_duration_since(self.started_at)
    }
}
