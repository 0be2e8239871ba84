//! Persistent job queue.
//!
//! All state changes after enqueue are compare-and-swap updates keyed on the
//! job id, its expected status and its attempt number, so a transition
//! decided on stale information affects zero rows instead of clobbering a
//! newer state. Callers learn whether they won from the returned `bool`.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Statement,
    TransactionTrait,
};
use strum::IntoEnumIterator;
use tracing::debug;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::database::is_postgres;
use crate::database::models::{
    attempt_outcome::AttemptOutcome,
    job_status::JobStatus,
    priority::Priority,
    resource_class::ResourceClass,
    training_attempt,
    training_job::{self, Entity as TrainingJobEntity, FailureRecord},
};
use crate::database::unique_constraint::is_unique_violation;
use crate::jobs::advisory_lock::lock_keys;
use crate::jobs::executor::AttemptTag;

#[derive(Debug, Clone)]
pub struct NewTrainingJob {
    pub user_id: String,
    pub dataset_id: Uuid,
    pub priority: Priority,
    pub resource_class: ResourceClass,
    pub hyperparameters: serde_json::Value,
    pub max_retries: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Created(training_job::Model),
    /// A non-terminal job for the same user and dataset already existed
    AlreadyQueued(training_job::Model),
}

impl Enqueued {
    pub const fn job(&self) -> &training_job::Model {
        match self {
            Self::Created(job) | Self::AlreadyQueued(job) => job,
        }
    }

    pub fn into_job(self) -> training_job::Model {
        match self {
            Self::Created(job) | Self::AlreadyQueued(job) => job,
        }
    }
}

/// Inserts a queued job unless the user already has a non-terminal job for
/// the same dataset, in which case that job is returned.
pub async fn enqueue(
    db: &DatabaseConnection,
    new_job: NewTrainingJob,
) -> Result<Enqueued, DbErr> {
    if let Some(existing) = find_open_for_dataset(db, &new_job.user_id, new_job.dataset_id).await? {
        return Ok(Enqueued::AlreadyQueued(existing));
    }

    let now = chrono::Utc::now().naive_utc();
    let user_id = new_job.user_id.clone();
    let dataset_id = new_job.dataset_id;
    let job = training_job::ActiveModel {
        id: Set(Uuid::now_v7()),
        created_at: Set(now),
        updated_at: Set(now),
        user_id: Set(new_job.user_id),
        priority: Set(new_job.priority),
        status: Set(JobStatus::Queued),
        resource_class: Set(new_job.resource_class),
        dataset_id: Set(new_job.dataset_id),
        hyperparameters: Set(new_job.hyperparameters),
        attempt: Set(0),
        retry_count: Set(0),
        max_retries: Set(new_job.max_retries),
        dispatched_at: Set(None),
        started_at: Set(None),
        completed_at: Set(None),
        next_eligible_at: Set(None),
        cancel_requested_at: Set(None),
        last_error: Set(None),
        model_artifact_id: Set(None),
    };

    match job.insert(db).await {
        Ok(job) => Ok(Enqueued::Created(job)),
        // A concurrent submission won the partial unique index
        Err(e) if is_unique_violation(&e) => find_open_for_dataset(db, &user_id, dataset_id)
            .await?
            .map(Enqueued::AlreadyQueued)
            .ok_or(e),
        Err(e) => Err(e),
    }
}

pub async fn find_open_for_dataset<C: ConnectionTrait>(
    db: &C,
    user_id: &str,
    dataset_id: Uuid,
) -> Result<Option<training_job::Model>, DbErr> {
    TrainingJobEntity::find()
        .filter(training_job::Column::UserId.eq(user_id))
        .filter(training_job::Column::DatasetId.eq(dataset_id))
        .filter(training_job::Column::Status.is_in(JobStatus::NON_TERMINAL))
        .one(db)
        .await
}

pub async fn find<C: ConnectionTrait>(
    db: &C,
    job_id: Uuid,
) -> Result<Option<training_job::Model>, DbErr> {
    TrainingJobEntity::find_by_id(job_id).one(db).await
}

/// Jobs of a user, newest first.
pub async fn list_for_user(
    db: &DatabaseConnection,
    user_id: &str,
    status: Option<JobStatus>,
) -> Result<Vec<training_job::Model>, DbErr> {
    let mut query = TrainingJobEntity::find().filter(training_job::Column::UserId.eq(user_id));
    if let Some(status) = status {
        query = query.filter(training_job::Column::Status.eq(status));
    }
    query
        .order_by_desc(training_job::Column::CreatedAt)
        .order_by_desc(training_job::Column::Id)
        .all(db)
        .await
}

pub async fn count_active<C: ConnectionTrait>(db: &C) -> Result<u64, DbErr> {
    TrainingJobEntity::find()
        .filter(training_job::Column::Status.is_in(JobStatus::ACTIVE))
        .count(db)
        .await
}

pub async fn count_active_by_class<C: ConnectionTrait>(
    db: &C,
) -> Result<HashMap<ResourceClass, u64>, DbErr> {
    let rows: Vec<(ResourceClass, i64)> = TrainingJobEntity::find()
        .select_only()
        .column(training_job::Column::ResourceClass)
        .column_as(training_job::Column::Id.count(), "active")
        .filter(training_job::Column::Status.is_in(JobStatus::ACTIVE))
        .group_by(training_job::Column::ResourceClass)
        .into_tuple()
        .all(db)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(class, count)| (class, u64::try_from(count).unwrap_or(0)))
        .collect())
}

/// Resource classes that still have room under the configured limits.
pub async fn open_resource_classes<C: ConnectionTrait>(
    db: &C,
    config: &SchedulerConfig,
) -> Result<Vec<ResourceClass>, DbErr> {
    if count_active(db).await? >= u64::from(config.max_concurrent_jobs) {
        return Ok(Vec::new());
    }

    let by_class = count_active_by_class(db).await?;
    Ok(ResourceClass::iter()
        .filter(|class| {
            config.resource_limit(*class).is_none_or(|limit| {
                by_class.get(class).copied().unwrap_or(0) < u64::from(limit)
            })
        })
        .collect())
}

/// Claims the next eligible queued job and moves it to `dispatched`,
/// bumping its attempt number.
///
/// Capacity is checked inside the same transaction as the claim. On
/// Postgres claimers additionally serialize on a transaction-scoped
/// advisory lock so concurrent instances cannot overbook.
pub async fn claim_next(
    db: &DatabaseConnection,
    config: &SchedulerConfig,
    now: NaiveDateTime,
) -> Result<Option<training_job::Model>, DbErr> {
    let txn = db.begin().await?;

    if is_postgres(db) {
        txn.execute(Statement::from_sql_and_values(
            sea_orm::DatabaseBackend::Postgres,
            "SELECT pg_advisory_xact_lock($1)",
            [lock_keys::CLAIM.into()],
        ))
        .await?;
    }

    let classes = open_resource_classes(&txn, config).await?;
    if classes.is_empty() {
        txn.commit().await?;
        return Ok(None);
    }

    loop {
        let Some(candidate) = TrainingJobEntity::find()
            .filter(training_job::Column::Status.eq(JobStatus::Queued))
            .filter(
                training_job::Column::NextEligibleAt
                    .is_null()
                    .or(training_job::Column::NextEligibleAt.lte(now)),
            )
            .filter(training_job::Column::ResourceClass.is_in(classes.iter().copied()))
            .order_by_desc(training_job::Column::Priority)
            .order_by_asc(training_job::Column::CreatedAt)
            .order_by_asc(training_job::Column::Id)
            .one(&txn)
            .await?
        else {
            txn.commit().await?;
            return Ok(None);
        };

        let claimed = TrainingJobEntity::update_many()
            .set(training_job::ActiveModel {
                status: Set(JobStatus::Dispatched),
                dispatched_at: Set(Some(now)),
                started_at: Set(None),
                updated_at: Set(now),
                ..Default::default()
            })
            .col_expr(
                training_job::Column::Attempt,
                Expr::col(training_job::Column::Attempt).add(1),
            )
            .filter(training_job::Column::Id.eq(candidate.id))
            .filter(training_job::Column::Status.eq(JobStatus::Queued))
            .filter(training_job::Column::Attempt.eq(candidate.attempt))
            .exec(&txn)
            .await?;

        if claimed.rows_affected == 1 {
            let job = find(&txn, candidate.id).await?;
            txn.commit().await?;
            return Ok(job);
        }

        debug!("Lost the claim race for job {}, trying the next one", candidate.id);
    }
}

/// Applies `changes` to the job only while it is still at `tag.attempt`
/// and in one of `expected`.
async fn transition<C: ConnectionTrait>(
    db: &C,
    tag: AttemptTag,
    expected: &[JobStatus],
    require_no_cancel: bool,
    changes: training_job::ActiveModel,
) -> Result<bool, DbErr> {
    let mut update = TrainingJobEntity::update_many()
        .set(changes)
        .filter(training_job::Column::Id.eq(tag.job_id))
        .filter(training_job::Column::Attempt.eq(tag.attempt))
        .filter(training_job::Column::Status.is_in(expected.iter().copied()));
    if require_no_cancel {
        update = update.filter(training_job::Column::CancelRequestedAt.is_null());
    }
    Ok(update.exec(db).await?.rows_affected == 1)
}

/// `dispatched -> running` on the executor's start acknowledgment.
pub async fn mark_running<C: ConnectionTrait>(
    db: &C,
    tag: AttemptTag,
    now: NaiveDateTime,
) -> Result<bool, DbErr> {
    transition(
        db,
        tag,
        &[JobStatus::Dispatched],
        false,
        training_job::ActiveModel {
            status: Set(JobStatus::Running),
            started_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        },
    )
    .await
}

/// `dispatched -> queued` when the executor refused or never acknowledged
/// the start. Does not consume a retry.
pub async fn revert_dispatch<C: ConnectionTrait>(
    db: &C,
    tag: AttemptTag,
    now: NaiveDateTime,
) -> Result<bool, DbErr> {
    transition(
        db,
        tag,
        &[JobStatus::Dispatched],
        true,
        training_job::ActiveModel {
            status: Set(JobStatus::Queued),
            dispatched_at: Set(None),
            updated_at: Set(now),
            ..Default::default()
        },
    )
    .await
}

pub async fn complete_succeeded<C: ConnectionTrait>(
    db: &C,
    tag: AttemptTag,
    model_artifact_id: Uuid,
    now: NaiveDateTime,
) -> Result<bool, DbErr> {
    transition(
        db,
        tag,
        &JobStatus::ACTIVE,
        true,
        training_job::ActiveModel {
            status: Set(JobStatus::Succeeded),
            completed_at: Set(Some(now)),
            model_artifact_id: Set(Some(model_artifact_id)),
            last_error: Set(None),
            updated_at: Set(now),
            ..Default::default()
        },
    )
    .await
}

/// Puts a failed attempt back in the queue, eligible again at `next_eligible_at`.
pub async fn schedule_retry<C: ConnectionTrait>(
    db: &C,
    tag: AttemptTag,
    retry_count: i32,
    next_eligible_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<bool, DbErr> {
    transition(
        db,
        tag,
        &JobStatus::ACTIVE,
        true,
        training_job::ActiveModel {
            status: Set(JobStatus::Queued),
            retry_count: Set(retry_count),
            next_eligible_at: Set(Some(next_eligible_at)),
            dispatched_at: Set(None),
            started_at: Set(None),
            last_error: Set(None),
            updated_at: Set(now),
            ..Default::default()
        },
    )
    .await
}

pub async fn fail_terminal<C: ConnectionTrait>(
    db: &C,
    tag: AttemptTag,
    failure: FailureRecord,
    now: NaiveDateTime,
) -> Result<bool, DbErr> {
    transition(
        db,
        tag,
        &JobStatus::ACTIVE,
        true,
        training_job::ActiveModel {
            status: Set(JobStatus::Failed),
            completed_at: Set(Some(now)),
            last_error: Set(Some(failure)),
            updated_at: Set(now),
            ..Default::default()
        },
    )
    .await
}

/// `queued -> cancelled` in one step, nothing was handed to an executor.
pub async fn cancel_queued<C: ConnectionTrait>(
    db: &C,
    job_id: Uuid,
    now: NaiveDateTime,
) -> Result<bool, DbErr> {
    let result = TrainingJobEntity::update_many()
        .set(training_job::ActiveModel {
            status: Set(JobStatus::Cancelled),
            cancel_requested_at: Set(Some(now)),
            completed_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(training_job::Column::Id.eq(job_id))
        .filter(training_job::Column::Status.eq(JobStatus::Queued))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Marks a dispatched or running job as cancel-pending. Returns false when
/// the job is not active or a cancel was already requested.
pub async fn request_cancel<C: ConnectionTrait>(
    db: &C,
    job_id: Uuid,
    now: NaiveDateTime,
) -> Result<bool, DbErr> {
    let result = TrainingJobEntity::update_many()
        .set(training_job::ActiveModel {
            cancel_requested_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(training_job::Column::Id.eq(job_id))
        .filter(training_job::Column::Status.is_in(JobStatus::ACTIVE))
        .filter(training_job::Column::CancelRequestedAt.is_null())
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

pub async fn mark_cancelled<C: ConnectionTrait>(
    db: &C,
    tag: AttemptTag,
    now: NaiveDateTime,
) -> Result<bool, DbErr> {
    transition(
        db,
        tag,
        &JobStatus::ACTIVE,
        false,
        training_job::ActiveModel {
            status: Set(JobStatus::Cancelled),
            completed_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        },
    )
    .await
}

/// Running jobs started at or before `cutoff` that have not been asked to stop.
pub async fn running_past_deadline(
    db: &DatabaseConnection,
    cutoff: NaiveDateTime,
) -> Result<Vec<training_job::Model>, DbErr> {
    TrainingJobEntity::find()
        .filter(training_job::Column::Status.eq(JobStatus::Running))
        .filter(training_job::Column::StartedAt.lte(cutoff))
        .filter(training_job::Column::CancelRequestedAt.is_null())
        .all(db)
        .await
}

pub async fn unacknowledged_dispatches(
    db: &DatabaseConnection,
    cutoff: NaiveDateTime,
) -> Result<Vec<training_job::Model>, DbErr> {
    TrainingJobEntity::find()
        .filter(training_job::Column::Status.eq(JobStatus::Dispatched))
        .filter(training_job::Column::DispatchedAt.lte(cutoff))
        .filter(training_job::Column::CancelRequestedAt.is_null())
        .all(db)
        .await
}

/// Active jobs whose cancel request has gone unacknowledged since `cutoff`.
pub async fn expired_cancellations(
    db: &DatabaseConnection,
    cutoff: NaiveDateTime,
) -> Result<Vec<training_job::Model>, DbErr> {
    TrainingJobEntity::find()
        .filter(training_job::Column::Status.is_in(JobStatus::ACTIVE))
        .filter(training_job::Column::CancelRequestedAt.lte(cutoff))
        .all(db)
        .await
}

/// Appends the outcome of the job's current attempt to its history.
pub async fn record_attempt<C: ConnectionTrait>(
    db: &C,
    job: &training_job::Model,
    outcome: AttemptOutcome,
    failure_reason: Option<String>,
    finished_at: NaiveDateTime,
) -> Result<training_attempt::Model, DbErr> {
    let started_at = job
        .started_at
        .or(job.dispatched_at)
        .unwrap_or(finished_at);

    training_attempt::ActiveModel {
        id: Set(Uuid::now_v7()),
        job_id: Set(job.id),
        attempt: Set(job.attempt),
        outcome: Set(outcome),
        started_at: Set(started_at),
        finished_at: Set(finished_at),
        duration_ms: Set(finished_at
            .signed_duration_since(started_at)
            .num_milliseconds()),
        failure_reason: Set(failure_reason),
    }
    .insert(db)
    .await
}

pub async fn attempts(
    db: &DatabaseConnection,
    job_id: Uuid,
) -> Result<Vec<training_attempt::Model>, DbErr> {
    training_attempt::Entity::find()
        .filter(training_attempt::Column::JobId.eq(job_id))
        .order_by_asc(training_attempt::Column::Attempt)
        .order_by_asc(training_attempt::Column::FinishedAt)
        .all(db)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::training_job::FailureKind;
    use crate::tests::fixtures::{insert_dataset, new_job, queue_job, set_created_at};
    use crate::tests::setup_test::setup_app;
    use chrono::Duration;

    fn scheduler_config(max_concurrent_jobs: u32) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_jobs,
            ..SchedulerConfig::default()
        }
    }

    fn now() -> NaiveDateTime {
        chrono::Utc::now().naive_utc()
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_user_and_dataset() {
        let app = setup_app().await;
        let dataset = insert_dataset(&app.db, "user-1").await;

        let first = enqueue(&app.db, new_job("user-1", dataset.id, Priority::Medium))
            .await
            .unwrap();
        let second = enqueue(&app.db, new_job("user-1", dataset.id, Priority::High))
            .await
            .unwrap();

        assert!(matches!(first, Enqueued::Created(_)));
        assert!(matches!(second, Enqueued::AlreadyQueued(_)));
        assert_eq!(first.job().id, second.job().id);
        assert_eq!(list_for_user(&app.db, "user-1", None).await.unwrap().len(), 1);

        // A terminal job frees the slot
        cancel_queued(&app.db, first.job().id, now()).await.unwrap();
        let third = enqueue(&app.db, new_job("user-1", dataset.id, Priority::Medium))
            .await
            .unwrap();
        assert!(matches!(third, Enqueued::Created(_)));
        assert_ne!(third.job().id, first.job().id);
    }

    #[tokio::test]
    async fn test_partial_index_rejects_second_open_job() {
        let app = setup_app().await;
        let job = queue_job(&app.db, "user-1", Priority::Low).await;

        let mut duplicate = training_job::ActiveModel::from(job).reset_all();
        duplicate.id = Set(Uuid::now_v7());
        let error = duplicate.insert(&app.db).await.unwrap_err();

        assert!(is_unique_violation(&error));
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let app = setup_app().await;
        let config = scheduler_config(10);
        let t1 = now() - Duration::minutes(10);

        let a = queue_job(&app.db, "user-a", Priority::Low).await;
        let b = queue_job(&app.db, "user-b", Priority::High).await;
        let c = queue_job(&app.db, "user-c", Priority::High).await;
        set_created_at(&app.db, a.id, t1).await;
        set_created_at(&app.db, b.id, t1 + Duration::minutes(1)).await;
        set_created_at(&app.db, c.id, t1 + Duration::minutes(2)).await;

        let mut order = Vec::new();
        while let Some(job) = claim_next(&app.db, &config, now()).await.unwrap() {
            order.push(job.id);
        }

        assert_eq!(order, vec![b.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn test_claim_breaks_priority_ties_by_age() {
        let app = setup_app().await;
        let config = scheduler_config(10);
        let t1 = now() - Duration::minutes(10);

        let newer = queue_job(&app.db, "user-a", Priority::Medium).await;
        let older = queue_job(&app.db, "user-b", Priority::Medium).await;
        set_created_at(&app.db, newer.id, t1 + Duration::minutes(5)).await;
        set_created_at(&app.db, older.id, t1).await;

        let first = claim_next(&app.db, &config, now()).await.unwrap().unwrap();
        assert_eq!(first.id, older.id);
    }

    #[tokio::test]
    async fn test_claim_bumps_attempt_and_respects_backoff() {
        let app = setup_app().await;
        let config = scheduler_config(10);
        let job = queue_job(&app.db, "user-1", Priority::Medium).await;

        let claimed = claim_next(&app.db, &config, now()).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Dispatched);
        assert_eq!(claimed.attempt, job.attempt + 1);
        assert!(claimed.dispatched_at.is_some());

        let retry_at = now() + Duration::minutes(5);
        assert!(schedule_retry(&app.db, claimed.attempt_tag(), 1, retry_at, now())
            .await
            .unwrap());

        assert_eq!(claim_next(&app.db, &config, now()).await.unwrap(), None);
        let reclaimed = claim_next(&app.db, &config, retry_at + Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempt, claimed.attempt + 1);
        assert_eq!(reclaimed.retry_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_claimers_never_exceed_capacity() {
        let app = setup_app().await;
        let config = scheduler_config(2);
        for user in 0..5 {
            queue_job(&app.db, &format!("user-{user}"), Priority::Medium).await;
        }

        let claimers: Vec<_> = (0..8)
            .map(|_| {
                let db = app.db.clone();
                let config = config.clone();
                tokio::spawn(async move { claim_next(&db, &config, now()).await.unwrap() })
            })
            .collect();

        let mut claimed = Vec::new();
        for claimer in claimers {
            if let Some(job) = claimer.await.unwrap() {
                claimed.push(job.id);
            }
        }
        claimed.sort();
        claimed.dedup();

        assert_eq!(claimed.len(), 2);
        assert_eq!(count_active(&app.db).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_honors_resource_class_limits() {
        let app = setup_app().await;
        let mut config = scheduler_config(3);
        config.resource_limits.insert(ResourceClass::Medium, 1);
        queue_job(&app.db, "user-1", Priority::High).await;
        queue_job(&app.db, "user-2", Priority::High).await;

        assert!(claim_next(&app.db, &config, now()).await.unwrap().is_some());
        assert_eq!(claim_next(&app.db, &config, now()).await.unwrap(), None);
        assert_eq!(
            open_resource_classes(&app.db, &config).await.unwrap(),
            vec![ResourceClass::Small, ResourceClass::Large]
        );
    }

    #[tokio::test]
    async fn test_transitions_are_fenced_by_attempt() {
        let app = setup_app().await;
        queue_job(&app.db, "user-1", Priority::Medium).await;
        let claimed = claim_next(&app.db, &scheduler_config(1), now())
            .await
            .unwrap()
            .unwrap();
        let stale = AttemptTag {
            job_id: claimed.id,
            attempt: claimed.attempt - 1,
        };

        assert!(!mark_running(&app.db, stale, now()).await.unwrap());
        assert!(mark_running(&app.db, claimed.attempt_tag(), now()).await.unwrap());

        let failure = FailureRecord {
            kind: FailureKind::Execution,
            message: "loss diverged".to_string(),
        };
        assert!(!fail_terminal(&app.db, stale, failure.clone(), now()).await.unwrap());
        assert!(fail_terminal(&app.db, claimed.attempt_tag(), failure.clone(), now())
            .await
            .unwrap());

        let failed = find(&app.db, claimed.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error, Some(failure));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_cancel_blocks_terminal_transitions() {
        let app = setup_app().await;
        queue_job(&app.db, "user-1", Priority::Medium).await;
        let claimed = claim_next(&app.db, &scheduler_config(1), now())
            .await
            .unwrap()
            .unwrap();

        assert!(request_cancel(&app.db, claimed.id, now()).await.unwrap());
        assert!(!request_cancel(&app.db, claimed.id, now()).await.unwrap());
        assert!(!complete_succeeded(&app.db, claimed.attempt_tag(), Uuid::now_v7(), now())
            .await
            .unwrap());
        assert!(mark_cancelled(&app.db, claimed.attempt_tag(), now()).await.unwrap());

        let cancelled = find(&app.db, claimed.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_record_attempt_measures_duration() {
        let app = setup_app().await;
        queue_job(&app.db, "user-1", Priority::Medium).await;
        let claimed = claim_next(&app.db, &scheduler_config(1), now())
            .await
            .unwrap()
            .unwrap();
        let finished = claimed.dispatched_at.unwrap() + Duration::seconds(90);

        let attempt = record_attempt(
            &app.db,
            &claimed,
            AttemptOutcome::Failed,
            Some("out of memory".to_string()),
            finished,
        )
        .await
        .unwrap();

        assert_eq!(attempt.duration_ms, 90_000);
        assert_eq!(attempts(&app.db, claimed.id).await.unwrap(), vec![attempt]);
    }

    #[tokio::test]
    async fn test_deadline_queries() {
        let app = setup_app().await;
        queue_job(&app.db, "user-1", Priority::Medium).await;
        let long_ago = now() - Duration::hours(7);
        let claimed = claim_next(&app.db, &scheduler_config(1), long_ago)
            .await
            .unwrap()
            .unwrap();

        let cutoff = now() - Duration::minutes(2);
        assert_eq!(unacknowledged_dispatches(&app.db, cutoff).await.unwrap().len(), 1);

        mark_running(&app.db, claimed.attempt_tag(), long_ago).await.unwrap();
        assert!(unacknowledged_dispatches(&app.db, cutoff).await.unwrap().is_empty());
        assert_eq!(
            running_past_deadline(&app.db, now() - Duration::hours(6))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(expired_cancellations(&app.db, cutoff).await.unwrap().is_empty());
    }
}
