use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::task::TaskTuningConfig;
use crate::metadata::StreamKind;

const DEFAULT_TASK_DURATION_SECS: u64 = 60 * 60;
const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_START_DELAY_SECS: u64 = 5;
const DEFAULT_PERIOD_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 80;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CHAT_RETRIES: u32 = 8;

/// Per-datasource supervisor configuration: how many task groups and
/// replicas to run, how long each generation reads, and how patient to be
/// with tasks that stop responding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    pub datasource: String,
    pub stream: String,
    pub kind: StreamKind,
    #[serde(default = "default_one")]
    pub replicas: usize,
    #[serde(default = "default_one")]
    pub task_count: usize,
    #[serde(default = "default_task_duration", with = "super::duration_ms")]
    pub task_duration: Duration,
    /// How long a pending-completion group may take to publish before its
    /// stragglers are killed.
    #[serde(default = "default_completion_timeout", with = "super::duration_ms")]
    pub completion_timeout: Duration,
    #[serde(default = "default_start_delay", with = "super::duration_ms")]
    pub start_delay: Duration,
    #[serde(default = "default_period", with = "super::duration_ms")]
    pub period: Duration,
    /// Where to start partitions absent from stored metadata: the retention
    /// bound (earliest) or the head of the stream (latest).
    #[serde(default)]
    pub use_earliest_sequence_number: bool,
    #[serde(default, with = "super::opt_duration_ms")]
    pub late_message_rejection_period: Option<Duration>,
    #[serde(default, with = "super::opt_duration_ms")]
    pub early_message_rejection_period: Option<Duration>,
    #[serde(default = "default_chat_retries")]
    pub chat_retries: u32,
    #[serde(default = "default_http_timeout", with = "super::duration_ms")]
    pub http_timeout: Duration,
    #[serde(default = "default_shutdown_timeout", with = "super::duration_ms")]
    pub shutdown_timeout: Duration,
    /// Tuning handed to every spawned task.
    #[serde(default)]
    pub task_tuning: TaskTuningConfig,
}

impl SupervisorConfig {
    pub fn new(datasource: impl Into<String>, stream: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            datasource: datasource.into(),
            stream: stream.into(),
            kind,
            replicas: 1,
            task_count: 1,
            task_duration: default_task_duration(),
            completion_timeout: default_completion_timeout(),
            start_delay: default_start_delay(),
            period: default_period(),
            use_earliest_sequence_number: false,
            late_message_rejection_period: None,
            early_message_rejection_period: None,
            chat_retries: DEFAULT_CHAT_RETRIES,
            http_timeout: default_http_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            task_tuning: TaskTuningConfig::default(),
        }
    }
}

fn default_one() -> usize {
    1
}

fn default_task_duration() -> Duration {
    Duration::from_secs(DEFAULT_TASK_DURATION_SECS)
}

fn default_completion_timeout() -> Duration {
    Duration::from_secs(DEFAULT_COMPLETION_TIMEOUT_SECS)
}

fn default_start_delay() -> Duration {
    Duration::from_secs(DEFAULT_START_DELAY_SECS)
}

fn default_period() -> Duration {
    Duration::from_secs(DEFAULT_PERIOD_SECS)
}

fn default_chat_retries() -> u32 {
    DEFAULT_CHAT_RETRIES
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
}
