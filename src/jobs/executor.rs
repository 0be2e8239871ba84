//! Contract between the scheduler and the process that actually trains.
//!
//! The scheduler never looks inside a training run. It starts an attempt,
//! may ask it to stop, and consumes the events the executor reports back.
//! Every dispatch is tagged with the job's attempt number so signals from
//! an attempt the job has moved past can be recognized and dropped.

pub mod mock;
pub mod process;

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::database::models::{resource_class::ResourceClass, training_job};
use crate::jobs::DispatchError;

pub use mock::MockExecutor;
pub use process::ProcessExecutor;

/// Identifies one execution attempt of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptTag {
    pub job_id: Uuid,
    pub attempt: i32,
}

impl Display for AttemptTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job_id, self.attempt)
    }
}

/// Everything an executor needs to run one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDescriptor {
    pub job_id: Uuid,
    pub attempt: i32,
    pub user_id: String,
    pub dataset_id: Uuid,
    pub resource_class: ResourceClass,
    pub hyperparameters: serde_json::Value,
}

impl JobDescriptor {
    pub fn for_job(job: &training_job::Model) -> Self {
        Self {
            job_id: job.id,
            attempt: job.attempt,
            user_id: job.user_id.clone(),
            dataset_id: job.dataset_id,
            resource_class: job.resource_class,
            hyperparameters: job.hyperparameters.clone(),
        }
    }

    pub const fn tag(&self) -> AttemptTag {
        AttemptTag {
            job_id: self.job_id,
            attempt: self.attempt,
        }
    }
}

/// One metric observation from a running attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Executor-side time of the observation; receipt time when absent
    #[serde(default)]
    pub timestamp: Option<NaiveDateTime>,
    pub epoch: i32,
    pub loss: f64,
    #[serde(default)]
    pub throughput: f64,
    #[serde(default)]
    pub resource_utilization: f64,
}

/// What an executor can report about an attempt.
///
/// This is also the line format the process executor reads from a training
/// process, e.g. `{"type":"metrics","epoch":1,"loss":1.9}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorEventKind {
    /// The attempt is actually running
    Started,
    Metrics(MetricSample),
    Succeeded {
        storage_location: String,
        #[serde(default)]
        quality_metrics: serde_json::Value,
    },
    Failed {
        message: String,
    },
    /// The attempt stopped in response to `stop`
    Cancelled,
}

impl ExecutorEventKind {
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorEvent {
    pub tag: AttemptTag,
    pub kind: ExecutorEventKind,
}

pub type EventReceiver = mpsc::Receiver<ExecutorEvent>;

/// Sending half of the channel executors report events on.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<ExecutorEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Returns false once the scheduler side has shut down.
    pub async fn send(&self, tag: AttemptTag, kind: ExecutorEventKind) -> bool {
        let delivered = self.sender.send(ExecutorEvent { tag, kind }).await.is_ok();
        if !delivered {
            debug!("Dropping executor event for {tag}: event intake closed");
        }
        delivered
    }
}

#[async_trait]
pub trait TrainingExecutor: Send + Sync + std::fmt::Debug {
    /// Starts an attempt. Returning `Ok` means accepted, not running:
    /// the executor confirms the start with a `Started` event.
    async fn start(&self, descriptor: JobDescriptor, events: EventSink)
        -> Result<(), DispatchError>;

    /// Asks a running attempt to stop. The stop is confirmed with a `Cancelled` event.
    async fn stop(&self, tag: AttemptTag) -> Result<(), DispatchError>;
}

pub fn executor_from_config(config: &ExecutorConfig) -> Arc<dyn TrainingExecutor> {
    match config {
        ExecutorConfig::Mock { simulate } => Arc::new(MockExecutor::new(*simulate)),
        ExecutorConfig::Process {
            command,
            args,
            working_dir,
            max_processes,
        } => Arc::new(ProcessExecutor::new(
            command.clone(),
            args.clone(),
            working_dir.clone(),
            *max_processes,
        )),
    }
}
