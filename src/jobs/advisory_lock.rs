use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, Statement};
use std::{future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::database::is_postgres;

/// Advisory lock keys for background tasks that must run on one instance only
pub mod lock_keys {
    /// Session lock held by the instance running the scheduling loop
    pub const SCHEDULER: i64 = 0x4543_484F_5343_4844; // "ECHOSCHD"

    /// Session lock held by the instance running snapshot cleanup
    pub const CLEANUP: i64 = 0x4543_484F_434C_4E50; // "ECHOCLNP"

    /// Transaction lock serializing claims across instances
    pub const CLAIM: i64 = 0x4543_484F_434C_4D53; // "ECHOCLMS"
}

async fn query_lock_fn(db: &DatabaseConnection, function: &str, key: i64) -> Result<bool, DbErr> {
    let stmt = Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        format!("SELECT {function}($1)"),
        [key.into()],
    );

    let result = db.query_one(stmt).await?;
    Ok(result
        .and_then(|row| row.try_get_by_index::<bool>(0).ok())
        .unwrap_or(false))
}

pub async fn try_acquire_lock(db: &DatabaseConnection, key: i64) -> Result<bool, DbErr> {
    query_lock_fn(db, "pg_try_advisory_lock", key).await
}

pub async fn release_lock(db: &DatabaseConnection, key: i64) -> Result<bool, DbErr> {
    query_lock_fn(db, "pg_advisory_unlock", key).await
}

/// Runs a task with advisory lock protection so only one instance runs it
/// at a time. The task is restarted whenever it returns.
///
/// Backends without advisory locks are single-instance; the task runs there
/// without a lock.
pub async fn run_with_advisory_lock<F, Fut>(
    db: DatabaseConnection,
    lock_key: i64,
    task_name: &str,
    task_fn: F,
) where
    F: Fn(DatabaseConnection) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut restart_count = 0;

    loop {
        if !is_postgres(&db) {
            task_fn(db.clone()).await;
            restart_count += 1;
            error!("💥 {task_name} stopped (restart #{restart_count}) - restarting in 10s...");
            sleep(Duration::from_secs(10)).await;
            continue;
        }

        match try_acquire_lock(&db, lock_key).await {
            Ok(true) => {
                info!("🔒 Acquired advisory lock for {task_name}");

                task_fn(db.clone()).await;

                match release_lock(&db, lock_key).await {
                    Ok(true) => debug!("🔓 Released advisory lock for {task_name}"),
                    Ok(false) => debug!("🔓 Advisory lock for {task_name} was already released"),
                    Err(e) => warn!("Failed to release advisory lock for {task_name}: {e}"),
                }

                restart_count += 1;
                error!("💥 {task_name} stopped (restart #{restart_count}) - restarting in 10s...");
                sleep(Duration::from_secs(10)).await;
            }
            Ok(false) => {
                debug!("🔒 Advisory lock for {task_name} held by another instance, waiting...");

                // Jitter keeps standby instances from polling in lockstep
                let sleep_duration =
                    Duration::from_secs(5) + Duration::from_millis(fastrand::u64(0..2000));
                sleep(sleep_duration).await;
            }
            Err(e) => {
                error!("❌ Failed to acquire advisory lock for {task_name}: {e}");
                sleep(Duration::from_secs(10)).await;
            }
        }
    }
}
