use sea_orm::DeriveActiveEnum;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptOutcome {
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "timed_out")]
    TimedOut,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "dispatch_rejected")]
    DispatchRejected,
}

impl AttemptOutcome {
    pub const fn is_successful(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Whether the attempt consumed part of the job's retry budget.
    pub const fn counts_as_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}
