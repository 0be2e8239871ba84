use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sea_orm::DatabaseConnection;
use thiserror::Error;
use tokio::sync::Notify;

use crate::{
    config::Config,
    dataset::{AnswerSource, DatabaseAnswerSource},
    environment::Environment,
    jobs::{
        executor::{EventReceiver, EventSink, TrainingExecutor},
        progress::ProgressReporter,
        scheduler::Scheduler,
    },
};

/// Executor events buffered before executors start waiting on the scheduler
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Shared application state handed to handlers and background tasks.
#[derive(Clone, Debug)]
pub struct App {
    pub config: Config,
    pub environment: Environment,
    pub db: DatabaseConnection,
    pub answers: Arc<dyn AnswerSource>,
    pub executor: Arc<dyn TrainingExecutor>,
    pub events: EventSink,
    pub progress: ProgressReporter,
    pub scheduler_wake: Arc<Notify>,
}

impl App {
    /// Builds the application state. The returned receiver carries executor
    /// events and must be handed to the job supervisor.
    pub fn new(
        config: Config,
        environment: Environment,
        db: DatabaseConnection,
        executor: Arc<dyn TrainingExecutor>,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
        let progress = ProgressReporter::new(db.clone(), &config.progress);
        let answers = Arc::new(DatabaseAnswerSource::new(db.clone()));

        let app = Self {
            config,
            environment,
            db,
            answers,
            executor,
            events,
            progress,
            scheduler_wake: Arc::new(Notify::new()),
        };
        (app, receiver)
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self)
    }

    /// Asks the scheduler loop for an early tick, e.g. after an enqueue.
    pub fn wake_scheduler(&self) {
        self.scheduler_wake.notify_one();
    }
}

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("Database connection error")]
    DatabaseError(#[from] sea_orm::DbErr),
    #[error("Database migrations in progress")]
    MigrationsInProgress,
}

impl IntoResponse for ReadinessError {
    fn into_response(self) -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, self.to_string()).into_response()
    }
}
