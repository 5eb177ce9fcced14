use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::{StreamKind, StreamPartitions};
use crate::sequence::PartitionId;

const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
const DEFAULT_INTERMEDIATE_HANDOFF_PERIOD_SECS: u64 = 60 * 60 * 24 * 365; // effectively never
const DEFAULT_MAX_PARSE_EXCEPTIONS: u64 = u64::MAX;

/// What one indexing task reads: the partition slice and its bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIoConfig {
    pub task_group_id: i32,
    /// Shared by all replicas of a group; per-sequence names are derived as
    /// `{base_sequence_name}_{sequence_id}`.
    pub base_sequence_name: String,
    pub start_partitions: StreamPartitions,
    pub end_partitions: StreamPartitions,
    /// Partitions whose start sequence number was already counted by a prior
    /// task's publish and must not be ingested again.
    #[serde(default)]
    pub exclusive_start_partitions: HashSet<PartitionId>,
    #[serde(default = "default_true")]
    pub use_transaction: bool,
    /// Integer-offset flavor only: tolerate (warn) missing offsets instead of
    /// failing the task.
    #[serde(default)]
    pub skip_offset_gaps: bool,
    #[serde(default)]
    pub minimum_message_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub maximum_message_time: Option<DateTime<Utc>>,
}

impl TaskIoConfig {
    pub fn stream(&self) -> &str {
        &self.start_partitions.stream
    }

    pub fn sequence_name(&self, sequence_id: i32) -> String {
        format!("{}_{}", self.base_sequence_name, sequence_id)
    }
}

/// Knobs governing checkpointing, publish and failure tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTuningConfig {
    /// How long to wait for handoff after a successful publish. Zero means
    /// wait forever. Elapsing is an alert, not a failure.
    #[serde(default, with = "super::duration_ms")]
    pub handoff_condition_timeout: Duration,
    /// Wall-clock period after which the open sequence is checkpointed even
    /// without a segment-boundary trigger.
    #[serde(default = "default_intermediate_handoff_period", with = "super::duration_ms")]
    pub intermediate_handoff_period: Duration,
    #[serde(default = "default_max_parse_exceptions")]
    pub max_parse_exceptions: u64,
    #[serde(default)]
    pub log_parse_exceptions: bool,
    #[serde(default)]
    pub max_saved_parse_exceptions: usize,
    /// On an unavailable start offset, ask the metadata store to reset
    /// instead of failing the task.
    #[serde(default)]
    pub reset_offset_automatically: bool,
    #[serde(default)]
    pub skip_sequence_number_availability_check: bool,
    #[serde(default = "default_poll_timeout", with = "super::duration_ms")]
    pub poll_timeout: Duration,
}

impl Default for TaskTuningConfig {
    fn default() -> Self {
        Self {
            handoff_condition_timeout: Duration::ZERO,
            intermediate_handoff_period: default_intermediate_handoff_period(),
            max_parse_exceptions: DEFAULT_MAX_PARSE_EXCEPTIONS,
            log_parse_exceptions: false,
            max_saved_parse_exceptions: 0,
            reset_offset_automatically: false,
            skip_sequence_number_availability_check: false,
            poll_timeout: default_poll_timeout(),
        }
    }
}

/// Everything a spawned task needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub task_id: String,
    pub datasource: String,
    pub kind: StreamKind,
    pub io: TaskIoConfig,
    #[serde(default)]
    pub tuning: TaskTuningConfig,
    /// Checkpoint history handed down by the supervisor when replacing a
    /// failed replica, keyed by sequence id.
    #[serde(default)]
    pub context_checkpoints: Option<std::collections::BTreeMap<i32, StreamPartitions>>,
}

impl TaskConfig {
    /// Segment lineage checks are skipped for the integer-offset flavor and
    /// enforced for the opaque-sequence flavor.
    pub fn skip_segment_lineage_check(&self) -> bool {
        self.kind == StreamKind::Kafka
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout() -> Duration {
    Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS)
}

fn default_intermediate_handoff_period() -> Duration {
    Duration::from_secs(DEFAULT_INTERMEDIATE_HANDOFF_PERIOD_SECS)
}

fn default_max_parse_exceptions() -> u64 {
    DEFAULT_MAX_PARSE_EXCEPTIONS
}
