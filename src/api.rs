use axum::{
    routing::{get, post},
    Router,
};

use crate::app::App;

pub mod api_error;
pub mod health_checks;
pub mod json_error;
pub mod models;
pub mod training_jobs;
pub mod validated_json;

/// Routes served under `/api`.
pub fn routes() -> Router<App> {
    Router::new()
        .route(
            "/users/{user_id}/training-jobs",
            get(training_jobs::list).post(training_jobs::submit),
        )
        .route("/training-jobs/{job_id}", get(training_jobs::show))
        .route("/training-jobs/{job_id}/history", get(training_jobs::history))
        .route("/training-jobs/{job_id}/events", get(training_jobs::events))
        .route("/training-jobs/{job_id}/cancel", post(training_jobs::cancel))
        .route(
            "/users/{user_id}/active-model",
            get(models::active).put(models::activate),
        )
        .route("/users/{user_id}/models", get(models::list))
}
