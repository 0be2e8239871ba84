//! `SeaORM` Entity binding a user to the artifact serving their persona

use sea_orm::entity::prelude::*;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "active_deployment")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: String,
    pub model_artifact_id: Uuid,
    pub activated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::model_artifact::Entity",
        from = "Column::ModelArtifactId",
        to = "super::model_artifact::Column::Id"
    )]
    ModelArtifact,
}

impl Related<super::model_artifact::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ModelArtifact.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
