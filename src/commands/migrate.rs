use std::{cmp, error::Error, process};

use sea_orm::DatabaseConnection;
use sea_orm_migration::{Migration, MigratorTrait};

use crate::{
    cli::MigrateAction,
    config::Config,
    database::{migrations::Migrator, setup_database_connection},
};

pub async fn handle_migrate_command(config: &Config, action: MigrateAction) {
    // A plain connection; serve-time background setup is not needed here
    let db = match setup_database_connection(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("❌ Could not connect to the database: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(&db, action).await {
        eprintln!("❌ Migration failed: {e}");
        process::exit(1);
    }
}

fn list(heading: &str, marker: &str, migrations: &[Migration]) {
    println!("{heading}");
    for migration in migrations {
        println!("  {marker} {}", migration.name());
    }
}

/// The last `steps` applied migrations, most recent first.
fn most_recent(applied: &[Migration], steps: u32) -> Vec<&Migration> {
    let count = cmp::min(steps as usize, applied.len());
    applied[applied.len() - count..].iter().rev().collect()
}

async fn run(db: &DatabaseConnection, action: MigrateAction) -> Result<(), Box<dyn Error>> {
    match action {
        MigrateAction::Up { steps } => {
            let pending = Migrator::get_pending_migrations(db).await?;
            if pending.is_empty() {
                println!("✅ All migrations are already up to date");
                return Ok(());
            }

            let count = steps.map_or(pending.len(), |steps| cmp::min(steps as usize, pending.len()));
            list(
                &format!("Running {count} migration(s) up:"),
                "📄",
                &pending[..count],
            );
            Migrator::up(db, steps).await?;
            println!("✅ Migrations completed successfully");
        }
        MigrateAction::Down { steps } => {
            let applied = Migrator::get_applied_migrations(db).await?;
            if applied.is_empty() {
                println!("❌ No migrations to roll back");
                return Ok(());
            }

            println!("Rolling back migrations:");
            for migration in most_recent(&applied, steps) {
                println!("  📄 {}", migration.name());
            }
            Migrator::down(db, Some(steps)).await?;
            println!("✅ Rollback completed successfully");
        }
        MigrateAction::Status => {
            let pending = Migrator::get_pending_migrations(db).await?;
            if pending.is_empty() {
                println!("✅ All migrations are up to date");
            } else {
                list("📋 Pending migrations:", "-", &pending);
            }
            list(
                "📋 Applied migrations:",
                "✓",
                &Migrator::get_applied_migrations(db).await?,
            );
        }
        MigrateAction::Reset => {
            println!("🔄 Resetting database (this will drop all data!)...");
            // `fresh` drops every table, including ones no migration knows about
            Migrator::fresh(db).await?;
            list(
                "Applied migrations:",
                "📄",
                &Migrator::get_applied_migrations(db).await?,
            );
            println!("✅ Database reset completed successfully");
        }
        MigrateAction::Reapply { steps } => {
            let applied = Migrator::get_applied_migrations(db).await?;
            if applied.is_empty() {
                println!("❌ No migrations to reapply");
                return Ok(());
            }

            println!("🔄 Reapplying migration(s):");
            for migration in most_recent(&applied, steps) {
                println!("  📄 {}", migration.name());
            }
            Migrator::down(db, Some(steps)).await?;
            Migrator::up(db, Some(steps)).await?;
            println!("✅ Reapply completed successfully");
        }
    }

    Ok(())
}
