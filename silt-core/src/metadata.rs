//! The durable "read up to here" commit for a datasource, and the algebra
//! the metadata store uses to merge, trim and compare commits from
//! concurrent writers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::sequence::{PartitionId, SequenceNumber};

/// Immutable snapshot of per-partition positions within one stream. Used as
/// start/end bounds for tasks and as the payload of an offset commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPartitions {
    pub stream: String,
    #[serde(rename = "partitionSequenceNumberMap")]
    pub partitions: BTreeMap<PartitionId, SequenceNumber>,
}

impl StreamPartitions {
    pub fn new(
        stream: impl Into<String>,
        partitions: BTreeMap<PartitionId, SequenceNumber>,
    ) -> Self {
        Self {
            stream: stream.into(),
            partitions,
        }
    }

    pub fn empty(stream: impl Into<String>) -> Self {
        Self::new(stream, BTreeMap::new())
    }
}

/// Stream flavor discriminator carried by every commit so readers know how
/// to interpret the sequence domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Kafka,
    Kinesis,
}

/// The offset commit stored against a datasource. Two commits only combine
/// when they describe the same flavor and stream; otherwise the algebra
/// degenerates to picking one side whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceMetadata {
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub partitions: StreamPartitions,
}

impl DataSourceMetadata {
    pub fn new(kind: StreamKind, partitions: StreamPartitions) -> Self {
        Self { kind, partitions }
    }

    /// Merge, with `other` winning on shared keys. Commits for a different
    /// flavor or stream replace this one entirely.
    pub fn plus(&self, other: &DataSourceMetadata) -> DataSourceMetadata {
        if self.kind != other.kind || self.partitions.stream != other.partitions.stream {
            return other.clone();
        }

        let mut merged = self.partitions.partitions.clone();
        for (partition, sequence) in &other.partitions.partitions {
            merged.insert(partition.clone(), sequence.clone());
        }

        DataSourceMetadata::new(
            self.kind,
            StreamPartitions::new(self.partitions.stream.clone(), merged),
        )
    }

    /// Remove the partitions named by `other`. Commits for a different
    /// flavor or stream leave this one untouched.
    pub fn minus(&self, other: &DataSourceMetadata) -> DataSourceMetadata {
        if self.kind != other.kind || self.partitions.stream != other.partitions.stream {
            return self.clone();
        }

        let remaining = self
            .partitions
            .partitions
            .iter()
            .filter(|(partition, _)| !other.partitions.partitions.contains_key(*partition))
            .map(|(p, s)| (p.clone(), s.clone()))
            .collect();

        DataSourceMetadata::new(
            self.kind,
            StreamPartitions::new(self.partitions.stream.clone(), remaining),
        )
    }

    /// Whether the two commits agree wherever they overlap.
    pub fn matches(&self, other: &DataSourceMetadata) -> bool {
        self.kind == other.kind && self.plus(other) == other.plus(self)
    }
}
