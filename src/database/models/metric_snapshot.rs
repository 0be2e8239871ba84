//! `SeaORM` Entity for training metric snapshots (append-only)

use sea_orm::entity::prelude::*;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "training_metric_snapshot")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub job_id: Uuid,
    pub attempt: i32,
    pub timestamp: DateTime,
    pub epoch: i32,
    pub loss: f64,
    /// Samples (or tokens) per second reported by the executor
    pub throughput: f64,
    /// Fraction of the reserved accelerator in use, 0.0..=1.0
    pub resource_utilization: f64,
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
