use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl Environment {
    /// Config file stem read by `config_rs`, relative to the working directory.
    #[must_use]
    pub fn config_file(&self) -> String {
        format!("config/{self}")
    }

    /// Executor and database defaults may be mocked outside production.
    #[must_use]
    pub const fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}
