//! `SeaORM` Entity for assembled, immutable training corpora

use sea_orm::entity::prelude::*;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "training_dataset")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub user_id: String,
    pub version: i32,
    /// SHA-256 over the canonical corpus; unique per user
    pub content_hash: String,
    #[serde(skip)]
    #[sea_orm(column_type = "Json")]
    pub corpus: Json,
    pub answer_count: i32,
    pub category_count: i32,
    pub quality_score: f64,
    #[sea_orm(column_type = "Json")]
    pub quality_report: Json,
    pub created_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
