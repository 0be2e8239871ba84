use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QuerySelect,
};
use sqlx::postgres::PgListener;
use std::{sync::Arc, time::Duration};
use tokio::{spawn, sync::Notify, time::sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    app::App,
    config::CleanupConfig,
    database::{
        is_postgres,
        models::{
            job_status::JobStatus,
            metric_snapshot::{self, Entity as MetricSnapshotEntity},
            training_job,
        },
    },
    jobs::{
        advisory_lock::{self, lock_keys},
        executor::EventReceiver,
        scheduler::Scheduler,
        SchedulerError,
    },
};

/// Channel fired by the database whenever a job becomes queued.
pub const QUEUED_CHANNEL: &str = "training_job_queued";

pub async fn job_supervisor(app: App, events: EventReceiver) {
    info!("🚀 Starting training job supervisor");

    // Events come from this instance's executor, so intake runs everywhere
    spawn(run_event_intake(app.scheduler(), events));

    start_scheduler(&app);

    start_cleanup_task(&app.config.cleanup, &app.db);

    run_supervisor_loop().await;
}

async fn run_event_intake(scheduler: Scheduler, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let tag = event.tag;
        match scheduler.handle_event(event).await {
            Ok(outcome) => debug!("Applied executor event for {tag}: {outcome:?}"),
            Err(SchedulerError::StaleResult(stale)) => warn!("⚠️ Discarding {stale}"),
            Err(e) => error!("❌ Failed to apply executor event for {tag}: {e}"),
        }
    }
    info!("Executor event intake closed");
}

fn start_scheduler(app: &App) {
    let scheduler = app.scheduler();
    let wake = Arc::clone(&app.scheduler_wake);

    spawn(advisory_lock::run_with_advisory_lock(
        app.db.clone(),
        lock_keys::SCHEDULER,
        "scheduler",
        move |db| {
            let scheduler = scheduler.clone();
            let wake = Arc::clone(&wake);
            async move {
                info!("📅 Starting training scheduler");
                run_scheduler_loop(&scheduler, &db, &wake).await;
            }
        },
    ));
}

/// Ticks on every interval, local wake-up or queue notification.
/// Returns on a database error so the lock wrapper restarts it.
async fn run_scheduler_loop(scheduler: &Scheduler, db: &DatabaseConnection, wake: &Notify) {
    let mut listener = listen_for_queued_jobs(db).await;
    let interval = scheduler.config().tick_interval();

    loop {
        match scheduler.tick().await {
            Ok(summary) if summary.dispatched > 0 => {
                info!("📅 Dispatched {} training job(s)", summary.dispatched);
            }
            Ok(_) => {}
            Err(e) => {
                error!("❌ Scheduler tick failed: {e}");
                return;
            }
        }

        let listener_lost = match listener.as_mut() {
            Some(listener) => tokio::select! {
                () = sleep(interval) => false,
                () = wake.notified() => false,
                notification = listener.recv() => match notification {
                    Ok(_) => false,
                    Err(e) => {
                        error!("Queue listener error: {e}. Switching to polling.");
                        true
                    }
                },
            },
            None => {
                tokio::select! {
                    () = sleep(interval) => {},
                    () = wake.notified() => {},
                }
                false
            }
        };
        if listener_lost {
            listener = None;
        }
    }
}

async fn listen_for_queued_jobs(db: &DatabaseConnection) -> Option<PgListener> {
    if !is_postgres(db) {
        return None;
    }

    let pool = db.get_postgres_connection_pool();
    match PgListener::connect_with(pool).await {
        Ok(mut listener) => match listener.listen(QUEUED_CHANNEL).await {
            Ok(()) => {
                debug!("Scheduler listening on '{QUEUED_CHANNEL}'");
                Some(listener)
            }
            Err(e) => {
                warn!("Failed to LISTEN on '{QUEUED_CHANNEL}': {e}. Using polling.");
                None
            }
        },
        Err(e) => {
            warn!("Failed to create queue listener: {e}. Using polling.");
            None
        }
    }
}

/// Keep the supervisor running indefinitely
async fn run_supervisor_loop() {
    loop {
        sleep(Duration::from_secs(3600)).await;
    }
}

fn start_cleanup_task(config: &CleanupConfig, db: &DatabaseConnection) {
    let cleanup_config = config.clone();

    spawn(advisory_lock::run_with_advisory_lock(
        db.clone(),
        lock_keys::CLEANUP,
        "snapshot cleanup",
        move |db| {
            let config = cleanup_config.clone();
            async move {
                info!("🧹 Starting metric snapshot cleanup task");
                run_cleanup_loop(&config, &db).await;
            }
        },
    ));
}

async fn run_cleanup_loop(config: &CleanupConfig, db: &DatabaseConnection) {
    loop {
        let now = chrono::Utc::now().naive_utc();
        match cleanup_expired_snapshots(config, db, now).await {
            Ok(0) => {}
            Ok(deleted) => info!("🧹 Deleted {deleted} expired metric snapshots"),
            Err(e) => error!("🧹 Failed to clean up metric snapshots: {e}"),
        }

        sleep(Duration::from_secs(config.interval_seconds)).await;
    }
}

/// Deletes snapshots of jobs that finished before the retention window.
/// Snapshots of jobs still in flight are never touched.
pub(crate) async fn cleanup_expired_snapshots(
    config: &CleanupConfig,
    db: &DatabaseConnection,
    now: chrono::NaiveDateTime,
) -> Result<u64, DbErr> {
    let retention = i64::try_from(config.snapshot_retention_seconds).unwrap_or(i64::MAX / 1000);
    let cutoff = now - chrono::Duration::seconds(retention);
    let mut deleted = 0;

    loop {
        let batch: Vec<Uuid> = MetricSnapshotEntity::find()
            .select_only()
            .column(metric_snapshot::Column::Id)
            .inner_join(training_job::Entity)
            .filter(training_job::Column::Status.is_in([
                JobStatus::Succeeded,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ]))
            .filter(training_job::Column::CompletedAt.lte(cutoff))
            .limit(config.batch_size)
            .into_tuple()
            .all(db)
            .await?;

        if batch.is_empty() {
            break;
        }

        let result = MetricSnapshotEntity::delete_many()
            .filter(metric_snapshot::Column::Id.is_in(batch))
            .exec(db)
            .await?;
        deleted += result.rows_affected;
        debug!("🧹 Deleted batch of {} metric snapshots", result.rows_affected);

        // Small delay between batches to avoid overwhelming the database
        sleep(Duration::from_millis(100)).await;
    }

    Ok(deleted)
}
