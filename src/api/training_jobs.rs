use std::future;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;
use uuid::Uuid;

use crate::{
    api::{api_error::ApiError, validated_json::ValidatedJson},
    app::App,
    coordinator::{self, JobHistory, JobStatusView, SubmitError, SubmitOptions},
    database::models::{job_status::JobStatus, training_job},
    jobs::{progress::ProgressUpdate, scheduler::CancelAck, store},
};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
}

/// `201` with the new job, or `200` with the job already open for the same corpus.
pub async fn submit(
    State(app): State<App>,
    Path(user_id): Path<String>,
    ValidatedJson(options): ValidatedJson<SubmitOptions>,
) -> Result<(StatusCode, Json<training_job::Model>), ApiError> {
    match coordinator::submit_training_job(&app, &user_id, options).await {
        Ok(job) => Ok((StatusCode::CREATED, Json(job))),
        Err(SubmitError::AlreadyQueued(job)) => Ok((StatusCode::OK, Json(*job))),
        Err(e) => Err(e.into()),
    }
}

pub async fn list(
    State(app): State<App>,
    Path(user_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<training_job::Model>>, ApiError> {
    Ok(Json(
        coordinator::list_jobs(&app, &user_id, query.status).await?,
    ))
}

pub async fn show(
    State(app): State<App>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusView>, ApiError> {
    coordinator::get_job_status(&app, job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::job_not_found(job_id))
}

pub async fn history(
    State(app): State<App>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobHistory>, ApiError> {
    coordinator::job_history(&app, job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::job_not_found(job_id))
}

pub async fn cancel(
    State(app): State<App>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelAck>), ApiError> {
    let ack = coordinator::cancel_job(&app, job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

/// Streams the job's progress as server-sent events: its current status
/// first, then every metric snapshot and status change until it finishes.
pub async fn events(
    State(app): State<App>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    // Subscribe before reading the job so no update falls in between
    let updates = app.progress.subscribe();
    let job = store::find(&app.db, job_id)
        .await?
        .ok_or_else(|| ApiError::job_not_found(job_id))?;

    let current = ProgressUpdate::Status {
        job_id,
        attempt: job.attempt,
        status: job.status,
    };
    let stream = stream::once(future::ready(current))
        .chain(follow_job(updates, job_id, job.status.is_terminal()))
        .map(|update| Event::default().event(event_name(&update)).json_data(update));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn follow_job(
    updates: broadcast::Receiver<ProgressUpdate>,
    job_id: Uuid,
    finished: bool,
) -> impl Stream<Item = ProgressUpdate> {
    stream::unfold((updates, finished), move |(mut updates, finished)| async move {
        if finished {
            return None;
        }

        loop {
            match updates.recv().await {
                Ok(update) if update.job_id() == job_id => {
                    let finished = matches!(
                        &update,
                        ProgressUpdate::Status { status, .. } if status.is_terminal()
                    );
                    return Some((update, (updates, finished)));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Progress stream for job {job_id} skipped {skipped} updates");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

const fn event_name(update: &ProgressUpdate) -> &'static str {
    match update {
        ProgressUpdate::Metrics { .. } => "metrics",
        ProgressUpdate::Status { .. } => "status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::priority::Priority;
    use crate::tests::fixtures::{insert_answers, queue_job, running_job};
    use crate::tests::setup_test::setup_test;
    use serde_json::{json, Value};

    const CATEGORIES: [&str; 6] = ["childhood", "family", "work", "love", "loss", "advice"];

    #[tokio::test]
    async fn test_submit_creates_then_returns_open_job() {
        let test = setup_test().await;
        insert_answers(&test.app.db, "user-1", 60, &CATEGORIES).await;

        let created = test
            .server
            .post("/api/users/user-1/training-jobs")
            .json(&json!({"priority": "high", "hyperparameters": {"epochs": 4}}))
            .await;
        created.assert_status(StatusCode::CREATED);
        let job: Value = created.json();
        assert_eq!(job["status"], "queued");
        assert_eq!(job["priority"], "high");
        assert_eq!(job["hyperparameters"]["epochs"], 4);

        // No body means default options
        let again = test.server.post("/api/users/user-1/training-jobs").await;
        again.assert_status(StatusCode::OK);
        assert_eq!(again.json::<Value>()["id"], job["id"]);
    }

    #[tokio::test]
    async fn test_submit_with_too_little_data_is_unprocessable() {
        let test = setup_test().await;
        insert_answers(&test.app.db, "user-1", 10, &["childhood"]).await;

        let response = test.server.post("/api/users/user-1/training-jobs").await;

        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = response.json();
        assert_eq!(body["error"], "insufficient_data");
        let criteria: Vec<&str> = body["failures"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["criterion"].as_str().unwrap())
            .collect();
        assert_eq!(criteria, vec!["min_answers", "min_categories"]);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_bodies() {
        let test = setup_test().await;

        let out_of_range = test
            .server
            .post("/api/users/user-1/training-jobs")
            .json(&json!({"hyperparameters": {"lora_rank": 0}}))
            .await;
        out_of_range.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(out_of_range.json::<Value>()["error"], "validation_failed");

        let malformed = test
            .server
            .post("/api/users/user-1/training-jobs")
            .text("{not json")
            .await;
        malformed.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(malformed.json::<Value>()["error"], "invalid_json");
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let test = setup_test().await;
        let now = chrono::Utc::now().naive_utc();
        queue_job(&test.app.db, "user-1", Priority::Low).await;
        let running = running_job(&test.app.db, "user-1", now).await;
        queue_job(&test.app.db, "user-2", Priority::Low).await;

        let all: Vec<Value> = test
            .server
            .get("/api/users/user-1/training-jobs")
            .await
            .json();
        assert_eq!(all.len(), 2);

        let filtered: Vec<Value> = test
            .server
            .get("/api/users/user-1/training-jobs")
            .add_query_param("status", "running")
            .await
            .json();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["id"], running.id.to_string());
    }

    #[tokio::test]
    async fn test_show_and_cancel() {
        let test = setup_test().await;
        let job = queue_job(&test.app.db, "user-1", Priority::Medium).await;

        let shown = test.server.get(&format!("/api/training-jobs/{}", job.id)).await;
        shown.assert_status_ok();
        let body: Value = shown.json();
        assert_eq!(body["status"], "queued");
        assert_eq!(body["stale"], false);
        assert!(body["latest_snapshot"].is_null());

        let cancelled = test
            .server
            .post(&format!("/api/training-jobs/{}/cancel", job.id))
            .await;
        cancelled.assert_status(StatusCode::ACCEPTED);
        let ack: Value = cancelled.json();
        assert_eq!(ack["status"], "cancelled");
        assert_eq!(ack["pending"], false);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let test = setup_test().await;
        let id = Uuid::now_v7();

        for path in [
            format!("/api/training-jobs/{id}"),
            format!("/api/training-jobs/{id}/history"),
            format!("/api/training-jobs/{id}/events"),
        ] {
            test.server
                .get(&path)
                .await
                .assert_status(StatusCode::NOT_FOUND);
        }
        test.server
            .post(&format!("/api/training-jobs/{id}/cancel"))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_event_stream_of_finished_job_ends_after_current_status() {
        let test = setup_test().await;
        let job = queue_job(&test.app.db, "user-1", Priority::Medium).await;
        coordinator::cancel_job(&test.app, job.id).await.unwrap();

        let response = test
            .server
            .get(&format!("/api/training-jobs/{}/events", job.id))
            .await;

        response.assert_status_ok();
        let text = response.text();
        assert!(text.contains("event: status"));
        assert!(text.contains("\"status\":\"cancelled\""));
    }

    #[tokio::test]
    async fn test_follow_job_stops_after_terminal_status() {
        let test = setup_test().await;
        let job = running_job(&test.app.db, "user-1", chrono::Utc::now().naive_utc()).await;
        let other = Uuid::now_v7();
        let updates = test.app.progress.subscribe();
        let sender = test.app.progress.clone();

        let followed = tokio::spawn(follow_job(updates, job.id, false).collect::<Vec<_>>());

        let mut finished = job.clone();
        finished.status = JobStatus::Succeeded;
        let mut unrelated = job.clone();
        unrelated.id = other;
        sender.publish_status(&unrelated);
        sender.publish_status(&finished);
        sender.publish_status(&job);

        let received = followed.await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].job_id(), job.id);
    }
}
