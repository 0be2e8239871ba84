use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::{spawn, time::sleep};
use tracing::debug;

use super::{
    AttemptTag, EventSink, ExecutorEventKind, JobDescriptor, MetricSample, TrainingExecutor,
};
use crate::jobs::DispatchError;

#[derive(Debug, Default)]
struct MockState {
    started: Vec<JobDescriptor>,
    stopped: Vec<AttemptTag>,
    rejection: Option<DispatchError>,
}

/// In-memory executor that captures dispatches instead of training.
///
/// Tests drive the lifecycle themselves by feeding events to the scheduler.
/// With `simulate` set, every accepted start plays out a short successful run.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    state: Arc<Mutex<MockState>>,
    simulate: bool,
}

impl MockExecutor {
    pub fn new(simulate: bool) -> Self {
        Self {
            state: Arc::default(),
            simulate,
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Descriptors of every accepted start, in dispatch order
    pub fn started(&self) -> Vec<JobDescriptor> {
        self.state().started.clone()
    }

    pub fn stopped(&self) -> Vec<AttemptTag> {
        self.state().stopped.clone()
    }

    /// Makes subsequent starts fail with `error` until cleared with `None`.
    pub fn reject_starts(&self, error: Option<DispatchError>) {
        self.state().rejection = error;
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.started.clear();
        state.stopped.clear();
    }
}

#[async_trait]
impl TrainingExecutor for MockExecutor {
    async fn start(
        &self,
        descriptor: JobDescriptor,
        events: EventSink,
    ) -> Result<(), DispatchError> {
        let tag = descriptor.tag();
        {
            let mut state = self.state();
            if let Some(error) = state.rejection.clone() {
                return Err(error);
            }
            state.started.push(descriptor);
        }
        debug!("Mock executor accepted {tag}");

        if self.simulate {
            spawn(simulate_run(tag, events));
        }
        Ok(())
    }

    async fn stop(&self, tag: AttemptTag) -> Result<(), DispatchError> {
        self.state().stopped.push(tag);
        Ok(())
    }
}

async fn simulate_run(tag: AttemptTag, events: EventSink) {
    let step = Duration::from_millis(250);
    if !events.send(tag, ExecutorEventKind::Started).await {
        return;
    }
    for epoch in 1..=3 {
        sleep(step).await;
        let sample = MetricSample {
            timestamp: None,
            epoch,
            loss: 2.0 / f64::from(epoch),
            throughput: 120.0,
            resource_utilization: 0.5,
        };
        if !events.send(tag, ExecutorEventKind::Metrics(sample)).await {
            return;
        }
    }
    events
        .send(
            tag,
            ExecutorEventKind::Succeeded {
                storage_location: format!("mock://{}/{}", tag.job_id, tag.attempt),
                quality_metrics: serde_json::json!({ "final_loss": 2.0 / 3.0 }),
            },
        )
        .await;
}
