//! Drives training jobs through their lifecycle.
//!
//! The scheduler owns every status transition after enqueue. A tick first
//! resolves deadlines (running too long, unacknowledged dispatches,
//! unacknowledged cancels) and then dispatches queued jobs while capacity
//! remains. Executor events are applied through [`Scheduler::handle_event`],
//! which rejects signals for attempts the job has already moved past.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    app::App,
    config::{DeploymentConfig, SchedulerConfig},
    database::models::{
        attempt_outcome::AttemptOutcome,
        job_status::JobStatus,
        training_job::{self, FailureKind, FailureRecord},
    },
    deployment,
    jobs::{
        executor::{
            EventSink, ExecutorEvent, ExecutorEventKind, JobDescriptor, TrainingExecutor,
        },
        progress::ProgressReporter,
        store, SchedulerError, StaleResultError,
    },
    registry::{self, NewArtifact},
};

/// What a single tick changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub timed_out: usize,
    pub reverted: usize,
    pub forced_cancellations: usize,
    pub dispatched: usize,
}

impl TickSummary {
    pub const fn is_idle(&self) -> bool {
        self.timed_out == 0
            && self.reverted == 0
            && self.forced_cancellations == 0
            && self.dispatched == 0
    }
}

/// How an executor event was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The job moved to this status
    Transitioned(JobStatus),
    MetricsRecorded,
    /// Nothing to do, e.g. a repeated start acknowledgment
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelAck {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// The executor was asked to stop and has not confirmed yet
    pub pending: bool,
}

/// Exponential backoff: `base * 2^retry_count`, capped at the configured maximum.
/// `retry_count` is the number of retries already consumed.
pub fn retry_delay(config: &SchedulerConfig, retry_count: i32) -> Duration {
    let exponent = u32::try_from(retry_count).unwrap_or(0).min(32);
    let delay = config
        .base_retry_delay_seconds
        .saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_secs(delay.min(config.max_retry_delay_seconds))
}

fn seconds(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// The deadline cutoff `value` seconds before `now`, or `None` when it lies
/// before the earliest representable time and nothing can have expired.
fn cutoff(now: NaiveDateTime, value: u64) -> Option<NaiveDateTime> {
    now.checked_sub_signed(seconds(value))
}

fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    db: DatabaseConnection,
    config: SchedulerConfig,
    deployment: DeploymentConfig,
    executor: Arc<dyn TrainingExecutor>,
    events: EventSink,
    progress: ProgressReporter,
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(app: &App) -> Self {
        Self {
            db: app.db.clone(),
            config: app.config.scheduler.clone(),
            deployment: app.config.deployment.clone(),
            executor: Arc::clone(&app.executor),
            events: app.events.clone(),
            progress: app.progress.clone(),
            wake: Arc::clone(&app.scheduler_wake),
        }
    }

    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn tick(&self) -> Result<TickSummary, SchedulerError> {
        self.tick_at(now()).await
    }

    /// Runs one scheduling pass as of `now`.
    pub async fn tick_at(&self, now: NaiveDateTime) -> Result<TickSummary, SchedulerError> {
        let summary = TickSummary {
            timed_out: self.expire_running(now).await?,
            reverted: self.revert_unacknowledged(now).await?,
            forced_cancellations: self.force_expired_cancellations(now).await?,
            dispatched: self.dispatch_available(now).await?,
        };

        if !summary.is_idle() {
            debug!("Scheduler tick: {summary:?}");
        }
        Ok(summary)
    }

    async fn dispatch_available(&self, now: NaiveDateTime) -> Result<usize, SchedulerError> {
        let mut dispatched = 0;

        while let Some(job) = store::claim_next(&self.db, &self.config, now).await? {
            let tag = job.attempt_tag();
            match self
                .executor
                .start(JobDescriptor::for_job(&job), self.events.clone())
                .await
            {
                Ok(()) => {
                    info!(
                        "🔧 Dispatched training job {tag} for user {} ({}, {})",
                        job.user_id, job.priority, job.resource_class
                    );
                    self.progress.publish_status(&job);
                    dispatched += 1;
                }
                Err(e) => {
                    warn!("⚠️ Executor did not take training job {tag}: {e}");
                    self.revert(&job, AttemptOutcome::DispatchRejected, e.to_string(), now)
                        .await?;
                    // The executor is refusing work; try again next tick
                    break;
                }
            }
        }

        Ok(dispatched)
    }

    // The job leaves its attempt before the executor is told to stop, so the
    // stop confirmation arrives as a stale signal instead of a cancel.
    async fn expire_running(&self, now: NaiveDateTime) -> Result<usize, SchedulerError> {
        let Some(cutoff) = cutoff(now, self.config.max_running_seconds) else {
            return Ok(0);
        };
        let mut expired = 0;

        for job in store::running_past_deadline(&self.db, cutoff).await? {
            let tag = job.attempt_tag();
            let message = format!(
                "no result within the {}s running limit",
                self.config.max_running_seconds
            );
            if self
                .fail_attempt(&job, FailureKind::Timeout, message, now)
                .await?
                .is_some()
            {
                expired += 1;
                if let Err(e) = self.executor.stop(tag).await {
                    warn!("Failed to stop timed out training job {tag}: {e}");
                }
            }
        }

        Ok(expired)
    }

    async fn revert_unacknowledged(&self, now: NaiveDateTime) -> Result<usize, SchedulerError> {
        let Some(cutoff) = cutoff(now, self.config.dispatch_ack_timeout_seconds) else {
            return Ok(0);
        };
        let mut reverted = 0;

        for job in store::unacknowledged_dispatches(&self.db, cutoff).await? {
            let tag = job.attempt_tag();
            let reason = format!(
                "start not acknowledged within {}s",
                self.config.dispatch_ack_timeout_seconds
            );
            if self
                .revert(&job, AttemptOutcome::DispatchRejected, reason, now)
                .await?
            {
                warn!("⚠️ Training job {tag} was never acknowledged by the executor, requeued");
                reverted += 1;
                if let Err(e) = self.executor.stop(tag).await {
                    debug!("Stop for unacknowledged job {tag} failed: {e}");
                }
            }
        }

        Ok(reverted)
    }

    async fn force_expired_cancellations(
        &self,
        now: NaiveDateTime,
    ) -> Result<usize, SchedulerError> {
        let Some(cutoff) = cutoff(now, self.config.cancel_ack_timeout_seconds) else {
            return Ok(0);
        };
        let mut forced = 0;

        for job in store::expired_cancellations(&self.db, cutoff).await? {
            warn!(
                "⚠️ Executor never confirmed the cancel of {}, cancelling anyway",
                job.attempt_tag()
            );
            let reason = "executor did not acknowledge the cancel".to_string();
            if self.finish_cancelled(&job, reason, now).await?.status().is_some() {
                forced += 1;
            }
        }

        Ok(forced)
    }

    /// Applies an executor event to the job it is tagged with.
    pub async fn handle_event(&self, event: ExecutorEvent) -> Result<EventOutcome, SchedulerError> {
        let tag = event.tag;
        let job = store::find(&self.db, tag.job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(tag.job_id))?;

        if job.attempt != tag.attempt || !job.status.is_active() {
            return Err(StaleResultError {
                tag,
                current_attempt: job.attempt,
                status: job.status,
            }
            .into());
        }

        let now = now();
        match event.kind {
            ExecutorEventKind::Started => {
                if self.acknowledge_start(&job, now).await? {
                    Ok(EventOutcome::Transitioned(JobStatus::Running))
                } else {
                    Ok(EventOutcome::Unchanged)
                }
            }
            ExecutorEventKind::Metrics(sample) => {
                // The first snapshot doubles as the start acknowledgment
                let started =
                    job.status == JobStatus::Dispatched && self.acknowledge_start(&job, now).await?;
                self.progress.record(tag, sample).await?;
                if started {
                    Ok(EventOutcome::Transitioned(JobStatus::Running))
                } else {
                    Ok(EventOutcome::MetricsRecorded)
                }
            }
            ExecutorEventKind::Cancelled if job.cancel_requested_at.is_some() => {
                self.finish_cancelled(&job, "stopped by the executor".to_string(), now)
                    .await
            }
            kind if job.cancel_requested_at.is_some() => {
                debug!("Discarding {kind:?} for {tag}: cancel was requested first");
                self.finish_cancelled(&job, "cancel requested before the result".to_string(), now)
                    .await
            }
            ExecutorEventKind::Cancelled => {
                warn!("⚠️ Training job {tag} was stopped without a cancel request");
                let message = "executor stopped the attempt without a cancel request".to_string();
                Ok(self
                    .fail_attempt(&job, FailureKind::Execution, message, now)
                    .await?
                    .map_or(EventOutcome::Unchanged, EventOutcome::Transitioned))
            }
            ExecutorEventKind::Succeeded {
                storage_location,
                quality_metrics,
            } => self.complete(&job, storage_location, quality_metrics, now).await,
            ExecutorEventKind::Failed { message } => Ok(self
                .fail_attempt(&job, FailureKind::Execution, message, now)
                .await?
                .map_or(EventOutcome::Unchanged, EventOutcome::Transitioned)),
        }
    }

    async fn acknowledge_start(
        &self,
        job: &training_job::Model,
        now: NaiveDateTime,
    ) -> Result<bool, SchedulerError> {
        let tag = job.attempt_tag();
        if !store::mark_running(&self.db, tag, now).await? {
            return Ok(false);
        }
        info!("🏃 Training job {tag} is running");
        self.publish(job.id).await?;
        self.wake.notify_one();
        Ok(true)
    }

    /// Records the artifact and marks the job succeeded in one transaction.
    async fn complete(
        &self,
        job: &training_job::Model,
        storage_location: String,
        quality_metrics: serde_json::Value,
        now: NaiveDateTime,
    ) -> Result<EventOutcome, SchedulerError> {
        let tag = job.attempt_tag();
        let txn = self.db.begin().await?;

        let artifact = registry::record(
            &txn,
            NewArtifact {
                job_id: job.id,
                user_id: job.user_id.clone(),
                dataset_id: job.dataset_id,
                storage_location,
                quality_metrics,
            },
        )
        .await?;

        if !store::complete_succeeded(&txn, tag, artifact.id, now).await? {
            txn.rollback().await?;
            return self.settle_lost_race(tag.job_id, tag.attempt, now).await;
        }
        store::record_attempt(&txn, job, AttemptOutcome::Succeeded, None, now).await?;
        txn.commit().await?;

        info!(
            "✅ Training job {tag} succeeded, artifact {} at {}",
            artifact.id, artifact.storage_location
        );

        if self.deployment.auto_activate {
            if let Err(e) = deployment::activate(&self.db, &job.user_id, artifact.id).await {
                error!("❌ Failed to activate artifact {} for {}: {e}", artifact.id, job.user_id);
            }
        }

        self.publish(job.id).await?;
        self.wake.notify_one();
        Ok(EventOutcome::Transitioned(JobStatus::Succeeded))
    }

    /// Requeues the job with backoff while retries remain, fails it otherwise.
    async fn fail_attempt(
        &self,
        job: &training_job::Model,
        kind: FailureKind,
        message: String,
        now: NaiveDateTime,
    ) -> Result<Option<JobStatus>, SchedulerError> {
        let tag = job.attempt_tag();
        let outcome = match kind {
            FailureKind::Execution => AttemptOutcome::Failed,
            FailureKind::Timeout => AttemptOutcome::TimedOut,
        };

        let txn = self.db.begin().await?;
        let status = if job.can_retry() {
            let delay = retry_delay(&self.config, job.retry_count);
            let next_eligible_at = now
                .checked_add_signed(seconds(delay.as_secs()))
                .unwrap_or(NaiveDateTime::MAX);
            if !store::schedule_retry(&txn, tag, job.retry_count + 1, next_eligible_at, now).await? {
                txn.rollback().await?;
                return Ok(self.settle_lost_race(tag.job_id, tag.attempt, now).await?.status());
            }
            warn!(
                "⚠️ Training job {tag} failed ({kind}: {message}), retry {} of {} in {delay:?}",
                job.retry_count + 1,
                job.max_retries
            );
            JobStatus::Queued
        } else {
            let failure = FailureRecord {
                kind,
                message: message.clone(),
            };
            if !store::fail_terminal(&txn, tag, failure, now).await? {
                txn.rollback().await?;
                return Ok(self.settle_lost_race(tag.job_id, tag.attempt, now).await?.status());
            }
            error!(
                "❌ Training job {tag} failed permanently after {} retries ({kind}: {message})",
                job.retry_count
            );
            JobStatus::Failed
        };
        store::record_attempt(&txn, job, outcome, Some(message), now).await?;
        txn.commit().await?;

        self.publish(job.id).await?;
        self.wake.notify_one();
        Ok(Some(status))
    }

    /// Returns a dispatched job to the queue without consuming a retry.
    async fn revert(
        &self,
        job: &training_job::Model,
        outcome: AttemptOutcome,
        reason: String,
        now: NaiveDateTime,
    ) -> Result<bool, SchedulerError> {
        let txn = self.db.begin().await?;
        if !store::revert_dispatch(&txn, job.attempt_tag(), now).await? {
            txn.rollback().await?;
            return Ok(false);
        }
        store::record_attempt(&txn, job, outcome, Some(reason), now).await?;
        txn.commit().await?;

        self.publish(job.id).await?;
        Ok(true)
    }

    async fn finish_cancelled(
        &self,
        job: &training_job::Model,
        reason: String,
        now: NaiveDateTime,
    ) -> Result<EventOutcome, SchedulerError> {
        let tag = job.attempt_tag();
        let txn = self.db.begin().await?;
        if !store::mark_cancelled(&txn, tag, now).await? {
            txn.rollback().await?;
            return Ok(EventOutcome::Unchanged);
        }
        store::record_attempt(&txn, job, AttemptOutcome::Cancelled, Some(reason), now).await?;
        txn.commit().await?;

        info!("🛑 Training job {tag} cancelled");
        self.publish(job.id).await?;
        self.wake.notify_one();
        Ok(EventOutcome::Transitioned(JobStatus::Cancelled))
    }

    /// A terminal transition lost its compare-and-swap. If a cancel got in
    /// first the cancel wins, otherwise the job has moved on and the result is dropped.
    async fn settle_lost_race(
        &self,
        job_id: Uuid,
        attempt: i32,
        now: NaiveDateTime,
    ) -> Result<EventOutcome, SchedulerError> {
        match store::find(&self.db, job_id).await? {
            Some(job) if job.attempt == attempt && job.cancel_pending() => {
                self.finish_cancelled(&job, "cancel requested before the result".to_string(), now)
                    .await
            }
            _ => Ok(EventOutcome::Unchanged),
        }
    }

    /// Cancels a job. Queued jobs are cancelled immediately; dispatched and
    /// running jobs are asked to stop and finish once the executor confirms
    /// or the cancel times out. Cancelling a finished job is a no-op.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelAck, SchedulerError> {
        loop {
            let job = store::find(&self.db, job_id)
                .await?
                .ok_or(SchedulerError::JobNotFound(job_id))?;
            let now = now();

            match job.status {
                status if status.is_terminal() => {
                    return Ok(CancelAck {
                        job_id,
                        status,
                        pending: false,
                    });
                }
                JobStatus::Queued => {
                    if store::cancel_queued(&self.db, job_id, now).await? {
                        info!("🛑 Cancelled queued training job {job_id}");
                        self.publish(job_id).await?;
                        return Ok(CancelAck {
                            job_id,
                            status: JobStatus::Cancelled,
                            pending: false,
                        });
                    }
                }
                status if job.cancel_requested_at.is_some() => {
                    return Ok(CancelAck {
                        job_id,
                        status,
                        pending: true,
                    });
                }
                status => {
                    if store::request_cancel(&self.db, job_id, now).await? {
                        let tag = job.attempt_tag();
                        info!("🛑 Requested cancel of training job {tag}");
                        if let Err(e) = self.executor.stop(tag).await {
                            warn!("Executor could not stop {tag}: {e}");
                        }
                        return Ok(CancelAck {
                            job_id,
                            status,
                            pending: true,
                        });
                    }
                }
            }
            // The job changed under us; look again
        }
    }

    async fn publish(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        if let Some(job) = store::find(&self.db, job_id).await? {
            self.progress.publish_status(&job);
        }
        Ok(())
    }
}

impl EventOutcome {
    pub const fn status(self) -> Option<JobStatus> {
        match self {
            Self::Transitioned(status) => Some(status),
            Self::MetricsRecorded | Self::Unchanged => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::priority::Priority;
    use crate::jobs::executor::{AttemptTag, MetricSample};
    use crate::jobs::DispatchError;
    use crate::tests::fixtures::{insert_dataset, new_job, queue_job};
    use crate::tests::setup_test::{setup_app, setup_app_with, TestApp};
    use chrono::Duration as ChronoDuration;

    fn event(tag: AttemptTag, kind: ExecutorEventKind) -> ExecutorEvent {
        ExecutorEvent { tag, kind }
    }

    fn succeeded(location: &str) -> ExecutorEventKind {
        ExecutorEventKind::Succeeded {
            storage_location: location.to_string(),
            quality_metrics: serde_json::json!({ "eval_loss": 0.31 }),
        }
    }

    fn failed(message: &str) -> ExecutorEventKind {
        ExecutorEventKind::Failed {
            message: message.to_string(),
        }
    }

    async fn job(app: &TestApp, id: Uuid) -> training_job::Model {
        store::find(&app.db, id).await.unwrap().unwrap()
    }

    /// Ticks and returns the job's tag once it has been dispatched and started.
    async fn start(app: &TestApp, scheduler: &Scheduler, id: Uuid, at: NaiveDateTime) -> AttemptTag {
        scheduler.tick_at(at).await.unwrap();
        let dispatched = job(app, id).await;
        assert_eq!(dispatched.status, JobStatus::Dispatched);
        scheduler
            .handle_event(event(dispatched.attempt_tag(), ExecutorEventKind::Started))
            .await
            .unwrap();
        dispatched.attempt_tag()
    }

    #[test]
    fn test_retry_delay_doubles_up_to_the_cap() {
        let config = SchedulerConfig::default();
        let delays: Vec<u64> = [0, 1, 2, 5, 6, 40]
            .into_iter()
            .map(|n| retry_delay(&config, n).as_secs())
            .collect();

        assert_eq!(delays, vec![30, 60, 120, 960, 1800, 1800]);
    }

    #[tokio::test]
    async fn test_happy_path_records_artifact_and_activates_it() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;

        let tag = start(&app, &scheduler, queued.id, now()).await;
        assert_eq!(app.executor_mock.started()[0].job_id, queued.id);
        assert_eq!(job(&app, queued.id).await.status, JobStatus::Running);

        let sample = MetricSample {
            timestamp: None,
            epoch: 1,
            loss: 1.4,
            throughput: 90.0,
            resource_utilization: 0.7,
        };
        let outcome = scheduler
            .handle_event(event(tag, ExecutorEventKind::Metrics(sample)))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::MetricsRecorded);

        let outcome = scheduler.handle_event(event(tag, succeeded("m-123"))).await.unwrap();
        assert_eq!(outcome, EventOutcome::Transitioned(JobStatus::Succeeded));

        let finished = job(&app, queued.id).await;
        assert_eq!(finished.status, JobStatus::Succeeded);
        let artifact = registry::find_for_job(&app.db, queued.id).await.unwrap().unwrap();
        assert_eq!(artifact.storage_location, "m-123");
        assert_eq!(finished.model_artifact_id, Some(artifact.id));

        let active = deployment::get_active(&app.db, "user-1").await.unwrap().unwrap();
        assert_eq!(active.artifact.id, artifact.id);

        let history = store::attempts(&app.db, queued.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Succeeded);
        assert_eq!(app.progress.history(queued.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_retry_with_backoff_then_fail_terminally() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let dataset = insert_dataset(&app.db, "user-1").await;
        let mut spec = new_job("user-1", dataset.id, Priority::Medium);
        spec.max_retries = 2;
        let id = store::enqueue(&app.db, spec).await.unwrap().into_job().id;

        let tag = start(&app, &scheduler, id, now()).await;
        scheduler.handle_event(event(tag, failed("CUDA out of memory"))).await.unwrap();
        let retried = job(&app, id).await;
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.next_eligible_at.unwrap() > now() + ChronoDuration::seconds(25));

        // Still backing off
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 0);

        let tag = start(&app, &scheduler, id, now() + ChronoDuration::seconds(31)).await;
        scheduler.handle_event(event(tag, failed("loss diverged"))).await.unwrap();
        assert_eq!(job(&app, id).await.retry_count, 2);

        let tag = start(&app, &scheduler, id, now() + ChronoDuration::seconds(61)).await;
        let outcome = scheduler.handle_event(event(tag, failed("loss diverged"))).await.unwrap();
        assert_eq!(outcome, EventOutcome::Transitioned(JobStatus::Failed));

        let failed_job = job(&app, id).await;
        assert_eq!(failed_job.status, JobStatus::Failed);
        assert_eq!(failed_job.retry_count, 2);
        assert_eq!(failed_job.attempt, 3);
        assert_eq!(
            failed_job.last_error,
            Some(FailureRecord {
                kind: FailureKind::Execution,
                message: "loss diverged".to_string(),
            })
        );

        let outcomes: Vec<AttemptOutcome> = store::attempts(&app.db, id)
            .await
            .unwrap()
            .into_iter()
            .map(|attempt| attempt.outcome)
            .collect();
        assert_eq!(outcomes, vec![AttemptOutcome::Failed; 3]);
    }

    #[tokio::test]
    async fn test_results_from_superseded_attempts_are_rejected() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;

        scheduler.tick().await.unwrap();
        let first = job(&app, queued.id).await.attempt_tag();

        // Never acknowledged: requeued, then dispatched again as attempt 2
        let later = now() + ChronoDuration::seconds(121);
        let summary = scheduler.tick_at(later).await.unwrap();
        assert_eq!(summary.reverted, 1);
        assert_eq!(summary.dispatched, 1);
        let current = job(&app, queued.id).await;
        assert_eq!(current.attempt, first.attempt + 1);

        let result = scheduler.handle_event(event(first, succeeded("m-old"))).await;
        assert!(matches!(result, Err(SchedulerError::StaleResult(_))));

        let unchanged = job(&app, queued.id).await;
        assert_eq!(unchanged.status, JobStatus::Dispatched);
        assert_eq!(registry::find_for_job(&app.db, queued.id).await.unwrap(), None);

        // The current attempt's result is the one that counts
        let outcome = scheduler
            .handle_event(event(current.attempt_tag(), succeeded("m-new")))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Transitioned(JobStatus::Succeeded));
        let artifact = registry::find_for_job(&app.db, queued.id).await.unwrap().unwrap();
        assert_eq!(artifact.storage_location, "m-new");
    }

    #[tokio::test]
    async fn test_late_success_after_forced_cancel_is_discarded() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;
        let tag = start(&app, &scheduler, queued.id, now()).await;

        scheduler.cancel(queued.id).await.unwrap();
        scheduler
            .tick_at(now() + ChronoDuration::seconds(61))
            .await
            .unwrap();

        let late = scheduler.handle_event(event(tag, succeeded("m-late"))).await;
        assert!(matches!(late, Err(SchedulerError::StaleResult(_))));
        assert_eq!(job(&app, queued.id).await.status, JobStatus::Cancelled);
        assert_eq!(registry::find_for_job(&app.db, queued.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dispatch_respects_global_capacity() {
        let app = setup_app_with(|config| config.scheduler.max_concurrent_jobs = 1).await;
        let scheduler = app.scheduler();
        for user in ["user-1", "user-2", "user-3"] {
            queue_job(&app.db, user, Priority::Medium).await;
        }

        assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 0);
        assert_eq!(app.executor_mock.started().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_dispatch_requeues_without_consuming_a_retry() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;
        app.executor_mock
            .reject_starts(Some(DispatchError::Unavailable("no gpu".to_string())));

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.dispatched, 0);

        let requeued = job(&app, queued.id).await;
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.retry_count, 0);
        let history = store::attempts(&app.db, queued.id).await.unwrap();
        assert_eq!(history[0].outcome, AttemptOutcome::DispatchRejected);

        app.executor_mock.reject_starts(None);
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);
    }

    #[tokio::test]
    async fn test_running_too_long_times_out() {
        let app = setup_app_with(|config| {
            config.scheduler.max_running_seconds = 60;
            config.scheduler.base_retry_delay_seconds = 3600;
        })
        .await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;
        let tag = start(&app, &scheduler, queued.id, now()).await;

        let later = now() + ChronoDuration::seconds(120);
        let summary = scheduler.tick_at(later).await.unwrap();
        assert_eq!(summary.timed_out, 1);

        let retried = job(&app, queued.id).await;
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(app.executor_mock.stopped(), vec![tag]);
        let history = store::attempts(&app.db, queued.id).await.unwrap();
        assert_eq!(history[0].outcome, AttemptOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_late_success() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;
        let tag = start(&app, &scheduler, queued.id, now()).await;

        let ack = scheduler.cancel(queued.id).await.unwrap();
        assert_eq!(ack.status, JobStatus::Running);
        assert!(ack.pending);
        assert_eq!(app.executor_mock.stopped(), vec![tag]);

        let outcome = scheduler.handle_event(event(tag, succeeded("m-late"))).await.unwrap();
        assert_eq!(outcome, EventOutcome::Transitioned(JobStatus::Cancelled));
        assert_eq!(job(&app, queued.id).await.status, JobStatus::Cancelled);
        assert_eq!(registry::find_for_job(&app.db, queued.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_queued_is_immediate_and_terminal_cancel_is_noop() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;

        let ack = scheduler.cancel(queued.id).await.unwrap();
        assert_eq!(ack.status, JobStatus::Cancelled);
        assert!(!ack.pending);

        let again = scheduler.cancel(queued.id).await.unwrap();
        assert_eq!(again, ack);
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 0);

        let missing = scheduler.cancel(Uuid::now_v7()).await;
        assert!(matches!(missing, Err(SchedulerError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_unacknowledged_cancel_is_forced() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;
        start(&app, &scheduler, queued.id, now()).await;

        scheduler.cancel(queued.id).await.unwrap();
        let summary = scheduler
            .tick_at(now() + ChronoDuration::seconds(61))
            .await
            .unwrap();

        assert_eq!(summary.forced_cancellations, 1);
        assert_eq!(job(&app, queued.id).await.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_executor_confirmation_completes_cancel() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;
        let tag = start(&app, &scheduler, queued.id, now()).await;

        scheduler.cancel(queued.id).await.unwrap();
        let outcome = scheduler
            .handle_event(event(tag, ExecutorEventKind::Cancelled))
            .await
            .unwrap();

        assert_eq!(outcome, EventOutcome::Transitioned(JobStatus::Cancelled));
        let history = store::attempts(&app.db, queued.id).await.unwrap();
        assert_eq!(history[0].outcome, AttemptOutcome::Cancelled);

        // Anything after the terminal transition is stale
        let late = scheduler.handle_event(event(tag, failed("killed"))).await;
        assert!(matches!(late, Err(SchedulerError::StaleResult(_))));
    }

    #[tokio::test]
    async fn test_first_metrics_snapshot_acknowledges_start() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;

        scheduler.tick().await.unwrap();
        let tag = job(&app, queued.id).await.attempt_tag();
        let sample = MetricSample {
            timestamp: None,
            epoch: 1,
            loss: 1.9,
            throughput: 80.0,
            resource_utilization: 0.6,
        };
        let outcome = scheduler
            .handle_event(event(tag, ExecutorEventKind::Metrics(sample)))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Transitioned(JobStatus::Running));

        let running = job(&app, queued.id).await;
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());
        assert_eq!(app.progress.history(queued.id).await.unwrap().len(), 1);

        // Past the ack timeout the attempt is left alone
        let summary = scheduler
            .tick_at(now() + ChronoDuration::seconds(121))
            .await
            .unwrap();
        assert_eq!(summary.reverted, 0);
        assert_eq!(job(&app, queued.id).await.attempt, tag.attempt);
        assert!(app.executor_mock.stopped().is_empty());
    }

    #[tokio::test]
    async fn test_failure_wakes_the_dispatcher() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;
        let tag = start(&app, &scheduler, queued.id, now()).await;

        // Drop the wake-up left behind by the start acknowledgment
        let _ = tokio::time::timeout(Duration::from_millis(10), app.scheduler_wake.notified()).await;

        scheduler.handle_event(event(tag, failed("oom"))).await.unwrap();

        let woken =
            tokio::time::timeout(Duration::from_millis(100), app.scheduler_wake.notified()).await;
        assert!(woken.is_ok());
    }

    #[tokio::test]
    async fn test_unrequested_stop_is_an_execution_failure() {
        let app = setup_app().await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;
        let tag = start(&app, &scheduler, queued.id, now()).await;

        let outcome = scheduler
            .handle_event(event(tag, ExecutorEventKind::Cancelled))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Transitioned(JobStatus::Queued));

        let retried = job(&app, queued.id).await;
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        let history = store::attempts(&app.db, queued.id).await.unwrap();
        assert_eq!(history[0].outcome, AttemptOutcome::Failed);
    }

    #[tokio::test]
    async fn test_stop_confirmation_after_timeout_is_stale() {
        let app = setup_app_with(|config| {
            config.scheduler.max_running_seconds = 60;
            config.scheduler.base_retry_delay_seconds = 3600;
        })
        .await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;
        let tag = start(&app, &scheduler, queued.id, now()).await;

        let summary = scheduler
            .tick_at(now() + ChronoDuration::seconds(120))
            .await
            .unwrap();
        assert_eq!(summary.timed_out, 1);

        // The executor confirms the kill after the job already left the attempt
        let confirmation = scheduler
            .handle_event(event(tag, ExecutorEventKind::Cancelled))
            .await;
        assert!(matches!(confirmation, Err(SchedulerError::StaleResult(_))));

        let retried = job(&app, queued.id).await;
        assert_eq!(retried.status, JobStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        let history = store::attempts(&app.db, queued.id).await.unwrap();
        assert_eq!(history[0].outcome, AttemptOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_very_long_limits_do_not_overflow() {
        let app = setup_app_with(|config| {
            config.scheduler.max_running_seconds = u64::MAX;
            config.scheduler.dispatch_ack_timeout_seconds = u64::MAX;
            config.scheduler.cancel_ack_timeout_seconds = u64::MAX;
        })
        .await;
        let scheduler = app.scheduler();
        let queued = queue_job(&app.db, "user-1", Priority::Medium).await;

        let tag = start(&app, &scheduler, queued.id, now()).await;
        let summary = scheduler
            .tick_at(now() + ChronoDuration::days(365))
            .await
            .unwrap();
        assert_eq!(summary.timed_out, 0);
        assert_eq!(summary.reverted, 0);

        scheduler.handle_event(event(tag, failed("oom"))).await.unwrap();
        let retried = job(&app, queued.id).await;
        assert_eq!(retried.status, JobStatus::Queued);
        assert!(retried.next_eligible_at.unwrap() > now());
    }
}
