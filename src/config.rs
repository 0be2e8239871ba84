use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::database::models::resource_class::ResourceClass;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tracing: TracingConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub dataset: DatasetConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracingConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
}

/// Quality gates and scoring weights for assembling a training corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Minimum number of qualifying answers (default: 50)
    #[serde(default = "default_min_answers")]
    pub min_answers: usize,
    /// Minimum number of distinct question categories (default: 3)
    #[serde(default = "default_min_categories")]
    pub min_categories: usize,
    /// Answers shorter than this many words do not qualify (default: 5)
    #[serde(default = "default_min_answer_words")]
    pub min_answer_words: i32,
    /// Corpora scoring below this are rejected (default: 40.0)
    #[serde(default = "default_min_quality_score")]
    pub min_quality_score: f64,
    /// Category count at which coverage saturates (default: 6)
    #[serde(default = "default_target_categories")]
    pub target_categories: usize,
    /// Average answer length at which the length component saturates (default: 60)
    #[serde(default = "default_target_average_words")]
    pub target_average_words: f64,
    /// Distinct-to-total word ratio at which diversity saturates (default: 0.5)
    #[serde(default = "default_target_lexical_diversity")]
    pub target_lexical_diversity: f64,
    #[serde(default)]
    pub weights: QualityWeights,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            min_answers: default_min_answers(),
            min_categories: default_min_categories(),
            min_answer_words: default_min_answer_words(),
            min_quality_score: default_min_quality_score(),
            target_categories: default_target_categories(),
            target_average_words: default_target_average_words(),
            target_lexical_diversity: default_target_lexical_diversity(),
            weights: QualityWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityWeights {
    pub coverage: f64,
    pub length: f64,
    pub diversity: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            coverage: 0.4,
            length: 0.3,
            diversity: 0.3,
        }
    }
}

/// Concurrency and retry policy of the queue scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Jobs allowed in `dispatched` or `running` at once (default: 1)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Optional per-resource-class sub-limits, e.g. `large = 1`
    #[serde(default)]
    pub resource_limits: HashMap<ResourceClass, u32>,
    /// Seconds between scheduling ticks (default: 5)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
    /// Maximum number of automatic retries per job (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    /// Base delay in seconds before the first retry (default: 30)
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_seconds: u64,
    /// Upper bound on the retry delay (default: 1800 = 30 minutes)
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_seconds: u64,
    /// Running longer than this counts as a timed out attempt (default: 21600 = 6 hours)
    #[serde(default = "default_max_running")]
    pub max_running_seconds: u64,
    /// A dispatch without a start acknowledgment is reverted after this (default: 120)
    #[serde(default = "default_dispatch_ack_timeout")]
    pub dispatch_ack_timeout_seconds: u64,
    /// A cancel without executor acknowledgment is forced after this (default: 60)
    #[serde(default = "default_cancel_ack_timeout")]
    pub cancel_ack_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            resource_limits: HashMap::new(),
            tick_interval_seconds: default_tick_interval(),
            max_retries: default_max_retries(),
            base_retry_delay_seconds: default_base_retry_delay(),
            max_retry_delay_seconds: default_max_retry_delay(),
            max_running_seconds: default_max_running(),
            dispatch_ack_timeout_seconds: default_dispatch_ack_timeout(),
            cancel_ack_timeout_seconds: default_cancel_ack_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn resource_limit(&self, class: ResourceClass) -> Option<u32> {
        self.resource_limits.get(&class).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutorConfig {
    /// In-process executor that records dispatches without training anything.
    /// With `simulate` it also reports a short successful run for each start.
    Mock {
        #[serde(default)]
        simulate: bool,
    },
    /// External training process spawned per attempt
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_dir: Option<String>,
        /// Processes this instance may run at once (default: 1)
        #[serde(default = "default_process_slots")]
        max_processes: usize,
    },
}

/// Defaults merged under per-submission overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_base_model")]
    pub base_model: String,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_lora_rank")]
    pub lora_rank: u32,
    #[serde(default)]
    pub resource_class: ResourceClass,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            base_model: default_base_model(),
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            lora_rank: default_lora_rank(),
            resource_class: ResourceClass::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Running jobs silent for longer than this are reported as stale (default: 300)
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold_seconds: u64,
    /// Capacity of the in-process progress broadcast channel (default: 256)
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_seconds: default_staleness_threshold(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Activate each newly recorded artifact for its user (default: true)
    #[serde(default = "default_auto_activate")]
    pub auto_activate: bool,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            auto_activate: default_auto_activate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Interval between cleanup runs in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_cleanup_interval")]
    pub interval_seconds: u64,
    /// Metric snapshots of finished jobs are kept this long (default: 1209600 = 14 days)
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention_seconds: u64,
    /// Maximum number of snapshots to delete in a single batch (default: 1000)
    #[serde(default = "default_cleanup_batch_size")]
    pub batch_size: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_cleanup_interval(),
            snapshot_retention_seconds: default_snapshot_retention(),
            batch_size: default_cleanup_batch_size(),
        }
    }
}

const fn default_min_answers() -> usize {
    50
}

const fn default_min_categories() -> usize {
    3
}

const fn default_min_answer_words() -> i32 {
    5
}

const fn default_min_quality_score() -> f64 {
    40.0
}

const fn default_target_categories() -> usize {
    6
}

const fn default_target_average_words() -> f64 {
    60.0
}

const fn default_target_lexical_diversity() -> f64 {
    0.5
}

const fn default_max_concurrent_jobs() -> u32 {
    1
}

const fn default_tick_interval() -> u64 {
    5
}

const fn default_max_retries() -> i32 {
    3
}

const fn default_base_retry_delay() -> u64 {
    30
}

const fn default_max_retry_delay() -> u64 {
    1800 // 30 minutes
}

const fn default_max_running() -> u64 {
    21_600 // 6 hours
}

const fn default_dispatch_ack_timeout() -> u64 {
    120
}

const fn default_cancel_ack_timeout() -> u64 {
    60
}

const fn default_process_slots() -> usize {
    1
}

fn default_base_model() -> String {
    "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string()
}

const fn default_epochs() -> u32 {
    3
}

const fn default_learning_rate() -> f64 {
    2e-4
}

const fn default_lora_rank() -> u32 {
    16
}

const fn default_staleness_threshold() -> u64 {
    300 // 5 minutes
}

const fn default_broadcast_capacity() -> usize {
    256
}

const fn default_auto_activate() -> bool {
    true
}

const fn default_cleanup_interval() -> u64 {
    3600 // 1 hour
}

const fn default_snapshot_retention() -> u64 {
    1_209_600 // 14 days
}

const fn default_cleanup_batch_size() -> u64 {
    1000
}
