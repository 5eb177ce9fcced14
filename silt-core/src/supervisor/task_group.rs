//! Task-group bookkeeping. Active groups partition the stream's partition
//! set; each runs `replicas` identical tasks. Groups age into pending
//! completion once their tasks stop reading, and are discarded after their
//! publish lands or their completion deadline passes.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::runner::sequences::OffsetMap;
use crate::sequence::PartitionId;

/// Where a group's starting offsets came from; surfaced in the status
/// report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OffsetSource {
    StoredMetadata,
    EarliestInStream,
    LatestInStream,
    /// Picked up from the end offsets of the previous task generation.
    PriorTaskGroup,
    /// Inherited from a running task this supervisor did not launch.
    AdoptedTask,
}

#[derive(Debug, Clone)]
pub struct TaskGroup {
    pub group_id: i32,
    /// Shared by every replica; also the task-id prefix, which keeps task
    /// ids unique across supervisors.
    pub base_sequence_name: String,
    pub start_offsets: OffsetMap,
    pub offset_source: OffsetSource,
    pub minimum_message_time: Option<DateTime<Utc>>,
    pub maximum_message_time: Option<DateTime<Utc>>,
    pub replica_task_ids: HashSet<String>,
    pub exclusive_start_partitions: HashSet<PartitionId>,
    /// Sequence id → start offsets, mirroring each replica's sequence chain.
    pub checkpoint_history: BTreeMap<i32, OffsetMap>,
    /// Earliest start time reported by a replica; drives the task-duration
    /// handoff.
    pub earliest_task_start: Option<DateTime<Utc>>,
}

impl TaskGroup {
    pub fn new(
        group_id: i32,
        base_sequence_name: String,
        start_offsets: OffsetMap,
        offset_source: OffsetSource,
        minimum_message_time: Option<DateTime<Utc>>,
        maximum_message_time: Option<DateTime<Utc>>,
    ) -> Self {
        let checkpoint_history = BTreeMap::from([(0, start_offsets.clone())]);
        Self {
            group_id,
            base_sequence_name,
            start_offsets,
            offset_source,
            minimum_message_time,
            maximum_message_time,
            replica_task_ids: HashSet::new(),
            exclusive_start_partitions: HashSet::new(),
            checkpoint_history,
            earliest_task_start: None,
        }
    }

    pub fn partition_set(&self) -> HashSet<PartitionId> {
        self.start_offsets.keys().cloned().collect()
    }

    pub fn latest_checkpoint_id(&self) -> i32 {
        self.checkpoint_history
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }
}

/// A group whose tasks are past reading, kept until its publish completes
/// or the deadline passes.
#[derive(Debug, Clone)]
pub struct PendingCompletionGroup {
    pub group: TaskGroup,
    pub deadline: Instant,
}

/// Deterministic partition → group placement. Stable across processes and
/// restarts so existing tasks are adopted instead of recreated.
pub fn group_id_for(partition: &PartitionId, task_count: usize) -> i32 {
    let key = partition.to_string();
    let hash = key
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    (hash % task_count.max(1) as u32) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_placement_is_stable_and_in_range() {
        for task_count in [1usize, 2, 3, 8] {
            for partition in [
                PartitionId::Int(0),
                PartitionId::Int(7),
                PartitionId::Str("shardId-000000000001".to_string()),
            ] {
                let first = group_id_for(&partition, task_count);
                let second = group_id_for(&partition, task_count);
                assert_eq!(first, second);
                assert!((0..task_count as i32).contains(&first));
            }
        }
    }

    #[test]
    fn test_all_partitions_covered_with_two_groups() {
        let partitions: Vec<PartitionId> = (0..16).map(PartitionId::Int).collect();
        let mut seen_groups = HashSet::new();
        for partition in &partitions {
            seen_groups.insert(group_id_for(partition, 2));
        }
        assert_eq!(seen_groups, HashSet::from([0, 1]));
    }
}
