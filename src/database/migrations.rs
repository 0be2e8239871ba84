pub use sea_orm_migration::prelude::*;

mod m20261019_000001_create_reflection_answer;
mod m20261019_000002_create_training_dataset;
mod m20261019_000003_create_training_job;
mod m20261019_000004_create_model_registry;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261019_000001_create_reflection_answer::Migration),
            Box::new(m20261019_000002_create_training_dataset::Migration),
            Box::new(m20261019_000003_create_training_job::Migration),
            Box::new(m20261019_000004_create_model_registry::Migration),
        ]
    }
}

pub struct Migrator;
