//! Checkpointed sequence bookkeeping. A runner owns an ordered list of
//! sequences; each covers `[start, end)` per partition and maps to one
//! publish. Only the last sequence may be open (not checkpointed), and
//! consecutive sequences chain: `sequences[i].end == sequences[i+1].start`
//! for every shared partition.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::message::StreamRecord;
use crate::sequence::{PartitionId, SequenceNumber};
use crate::{Error, Result};

pub const SEQUENCES_FILE: &str = "sequences.json";

pub type OffsetMap = BTreeMap<PartitionId, SequenceNumber>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceMetadata {
    pub sequence_id: i32,
    pub sequence_name: String,
    pub start_offsets: OffsetMap,
    pub end_offsets: OffsetMap,
    pub checkpointed: bool,
    /// Partitions this sequence still expects records for. Derived state,
    /// rebuilt from the offsets on restore.
    #[serde(skip)]
    pub assignments: BTreeSet<PartitionId>,
}

impl SequenceMetadata {
    pub fn new(
        sequence_id: i32,
        sequence_name: String,
        start_offsets: OffsetMap,
        end_offsets: OffsetMap,
        checkpointed: bool,
    ) -> Self {
        let assignments = start_offsets.keys().cloned().collect();
        Self {
            sequence_id,
            sequence_name,
            start_offsets,
            end_offsets,
            checkpointed,
            assignments,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.assignments.is_empty()
    }

    /// Whether this sequence should ingest the record: it is open and the
    /// record's position lies within `[start, end)` of its partition.
    pub fn can_handle(&self, record: &StreamRecord) -> bool {
        let (Some(start), Some(end)) = (
            self.start_offsets.get(&record.partition_id),
            self.end_offsets.get(&record.partition_id),
        ) else {
            return false;
        };
        self.is_open() && record.sequence_number >= *start && record.sequence_number < *end
    }

    /// Finalizes the upper bound and marks the sequence checkpointed.
    pub fn set_end_offsets(&mut self, new_end_offsets: &OffsetMap) {
        for (partition, sequence) in new_end_offsets {
            self.end_offsets.insert(partition.clone(), sequence.clone());
        }
        self.checkpointed = true;
    }

    /// Closes the sequence at what was actually read: each partition's end
    /// is clamped down to the current position. An end already at or below
    /// the current position is final and stays untouched, so a restored
    /// chain keeps linking.
    pub fn finalize_end_at(&mut self, current_offsets: &OffsetMap) {
        for (partition, current) in current_offsets {
            match self.end_offsets.get(partition) {
                Some(end) if end <= current => {}
                _ => {
                    self.end_offsets.insert(partition.clone(), current.clone());
                }
            }
        }
        self.checkpointed = true;
    }

    /// Recomputes which partitions still have records to read, given the
    /// runner's current positions.
    pub fn update_assignments(&mut self, current_offsets: &OffsetMap) {
        self.assignments.clear();
        for (partition, current) in current_offsets {
            let Some(end) = self.end_offsets.get(partition) else {
                continue;
            };
            if *end == SequenceNumber::NoEnd || end > current {
                self.assignments.insert(partition.clone());
            }
        }
    }
}

/// Rebuilds the list from checkpoint history handed down by the supervisor:
/// consecutive checkpoints become closed sequences, the last one stays open
/// up to `end_offsets`.
pub fn from_checkpoints(
    base_sequence_name: &str,
    checkpoints: &BTreeMap<i32, OffsetMap>,
    end_offsets: &OffsetMap,
) -> Vec<SequenceMetadata> {
    let mut sequences = Vec::with_capacity(checkpoints.len());
    let entries: Vec<(&i32, &OffsetMap)> = checkpoints.iter().collect();
    for window in entries.windows(2) {
        let (id, start) = window[0];
        let (_, end) = window[1];
        sequences.push(SequenceMetadata::new(
            *id,
            format!("{base_sequence_name}_{id}"),
            start.clone(),
            end.clone(),
            true,
        ));
    }
    if let Some((id, start)) = entries.last() {
        sequences.push(SequenceMetadata::new(
            **id,
            format!("{base_sequence_name}_{id}"),
            (*start).clone(),
            end_offsets.clone(),
            false,
        ));
    }
    sequences
}

pub fn sequences_file(persist_dir: &Path) -> PathBuf {
    persist_dir.join(SEQUENCES_FILE)
}

/// Rewrites the sequences file; called on every sequence mutation.
pub async fn persist(persist_dir: &Path, sequences: &[SequenceMetadata]) -> Result<()> {
    let payload = serde_json::to_vec_pretty(sequences)
        .map_err(|e| Error::Persist(format!("failed to encode sequences: {e}")))?;
    tokio::fs::create_dir_all(persist_dir)
        .await
        .map_err(|e| Error::Persist(format!("failed to create persist dir: {e}")))?;
    tokio::fs::write(sequences_file(persist_dir), payload)
        .await
        .map_err(|e| Error::Persist(format!("failed to write sequences file: {e}")))?;
    info!(sequence_count = sequences.len(), "Persisted sequences");
    Ok(())
}

/// `None` when no file exists (fresh task).
pub async fn restore(persist_dir: &Path) -> Result<Option<Vec<SequenceMetadata>>> {
    let path = sequences_file(persist_dir);
    let payload = match tokio::fs::read(&path).await {
        Ok(payload) => payload,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Persist(format!("failed to read sequences file: {e}"))),
    };
    let mut sequences: Vec<SequenceMetadata> = serde_json::from_slice(&payload)
        .map_err(|e| Error::Persist(format!("failed to decode sequences file: {e}")))?;
    for sequence in &mut sequences {
        sequence.assignments = sequence.start_offsets.keys().cloned().collect();
    }
    Ok(Some(sequences))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::StreamRecord;

    fn offsets(entries: &[(&str, SequenceNumber)]) -> OffsetMap {
        entries
            .iter()
            .map(|(p, s)| (PartitionId::from(*p), s.clone()))
            .collect()
    }

    fn int_offsets(entries: &[(&str, i64)]) -> OffsetMap {
        entries
            .iter()
            .map(|(p, s)| (PartitionId::from(*p), SequenceNumber::Int(*s)))
            .collect()
    }

    #[test]
    fn test_can_handle_bounds() {
        let sequence = SequenceMetadata::new(
            0,
            "base_0".to_string(),
            int_offsets(&[("0", 5)]),
            offsets(&[("0", SequenceNumber::NoEnd)]),
            false,
        );

        let record = |seq: i64| StreamRecord::new("events", 0, SequenceNumber::Int(seq), vec![]);
        assert!(!sequence.can_handle(&record(4)));
        assert!(sequence.can_handle(&record(5)));
        assert!(sequence.can_handle(&record(1_000_000)));

        let bounded = SequenceMetadata::new(
            0,
            "base_0".to_string(),
            int_offsets(&[("0", 5)]),
            int_offsets(&[("0", 10)]),
            false,
        );
        assert!(bounded.can_handle(&record(9)));
        assert!(!bounded.can_handle(&record(10)));
    }

    #[test]
    fn test_finalize_end_clamps_to_current_position() {
        // open sequence closes at the current position
        let mut open = SequenceMetadata::new(
            0,
            "base_0".to_string(),
            int_offsets(&[("0", 0)]),
            offsets(&[("0", SequenceNumber::NoEnd)]),
            false,
        );
        open.finalize_end_at(&int_offsets(&[("0", 5)]));
        assert!(open.checkpointed);
        assert_eq!(open.end_offsets, int_offsets(&[("0", 5)]));

        // an end the reader never reached is not overstated
        let mut ahead = SequenceMetadata::new(
            0,
            "base_0".to_string(),
            int_offsets(&[("0", 0)]),
            int_offsets(&[("0", 7)]),
            true,
        );
        ahead.finalize_end_at(&int_offsets(&[("0", 5)]));
        assert_eq!(ahead.end_offsets, int_offsets(&[("0", 5)]));

        // an already-passed end stays put so the chain keeps linking
        let mut behind = SequenceMetadata::new(
            0,
            "base_0".to_string(),
            int_offsets(&[("0", 0)]),
            int_offsets(&[("0", 2)]),
            true,
        );
        behind.finalize_end_at(&int_offsets(&[("0", 4)]));
        assert_eq!(behind.end_offsets, int_offsets(&[("0", 2)]));
    }

    #[test]
    fn test_update_assignments_drops_finished_partitions() {
        let mut sequence = SequenceMetadata::new(
            0,
            "base_0".to_string(),
            int_offsets(&[("0", 0), ("1", 0)]),
            int_offsets(&[("0", 5), ("1", 10)]),
            false,
        );

        sequence.update_assignments(&int_offsets(&[("0", 5), ("1", 7)]));
        assert_eq!(
            sequence.assignments,
            BTreeSet::from([PartitionId::Int(1)])
        );
        assert!(sequence.is_open());

        sequence.update_assignments(&int_offsets(&[("0", 5), ("1", 10)]));
        assert!(!sequence.is_open());
    }

    #[test]
    fn test_from_checkpoints_chains() {
        let checkpoints = BTreeMap::from([
            (0, int_offsets(&[("0", 0)])),
            (1, int_offsets(&[("0", 50)])),
            (2, int_offsets(&[("0", 90)])),
        ]);
        let end = offsets(&[("0", SequenceNumber::NoEnd)]);

        let sequences = from_checkpoints("base", &checkpoints, &end);
        assert_eq!(sequences.len(), 3);
        assert_eq!(sequences[0].sequence_name, "base_0");
        assert!(sequences[0].checkpointed);
        assert_eq!(sequences[0].end_offsets, sequences[1].start_offsets);
        assert_eq!(sequences[1].end_offsets, sequences[2].start_offsets);
        assert!(!sequences[2].checkpointed);
        assert_eq!(sequences[2].end_offsets, end);
    }

    #[tokio::test]
    async fn test_persist_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(restore(dir.path()).await.unwrap(), None);

        let sequences = vec![
            SequenceMetadata::new(
                0,
                "base_0".to_string(),
                int_offsets(&[("0", 0)]),
                int_offsets(&[("0", 7)]),
                true,
            ),
            SequenceMetadata::new(
                1,
                "base_1".to_string(),
                int_offsets(&[("0", 7)]),
                offsets(&[("0", SequenceNumber::NoEnd)]),
                false,
            ),
        ];
        persist(dir.path(), &sequences).await.unwrap();

        let restored = restore(dir.path()).await.unwrap().unwrap();
        assert_eq!(restored, sequences);
        assert_eq!(
            restored[1].assignments,
            BTreeSet::from([PartitionId::Int(0)])
        );
    }
}
