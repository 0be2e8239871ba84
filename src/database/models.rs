pub mod active_deployment;
pub mod attempt_outcome;
pub mod job_status;
pub mod metric_snapshot;
pub mod model_artifact;
pub mod priority;
pub mod reflection_answer;
pub mod resource_class;
pub mod training_attempt;
pub mod training_dataset;
pub mod training_job;
