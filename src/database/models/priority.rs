use sea_orm::DeriveActiveEnum;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Queue priority tier. Stored as its rank so `ORDER BY priority DESC`
/// yields high before medium before low.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
)]
#[sea_orm(rs_type = "i32", db_type = "Integer")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    #[sea_orm(num_value = 2)]
    High,
    #[sea_orm(num_value = 1)]
    #[default]
    Medium,
    #[sea_orm(num_value = 0)]
    Low,
}
