//! Record and partition value types shared by the runner, the supervisor and
//! the suppliers. A [`StreamRecord`] is cheap to clone: payloads are `Bytes`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::sequence::{PartitionId, SequenceNumber};

/// One partition of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamPartition {
    pub stream: String,
    pub partition_id: PartitionId,
}

impl StreamPartition {
    pub fn new(stream: impl Into<String>, partition_id: impl Into<PartitionId>) -> Self {
        Self {
            stream: stream.into(),
            partition_id: partition_id.into(),
        }
    }
}

impl std::fmt::Display for StreamPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stream, self.partition_id)
    }
}

/// An ordered record pulled from one partition. A record whose sequence
/// number is [`SequenceNumber::EndOfShard`] is a closed-shard marker, not
/// data.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub stream: String,
    pub partition_id: PartitionId,
    pub sequence_number: SequenceNumber,
    /// Payload blobs carried at this position, in arrival order.
    pub data: Vec<Bytes>,
}

impl StreamRecord {
    pub fn new(
        stream: impl Into<String>,
        partition_id: impl Into<PartitionId>,
        sequence_number: SequenceNumber,
        data: Vec<Bytes>,
    ) -> Self {
        Self {
            stream: stream.into(),
            partition_id: partition_id.into(),
            sequence_number,
            data,
        }
    }

    /// Marker record signalling that the shard is closed.
    pub fn end_of_shard(stream: impl Into<String>, partition_id: impl Into<PartitionId>) -> Self {
        Self {
            stream: stream.into(),
            partition_id: partition_id.into(),
            sequence_number: SequenceNumber::EndOfShard,
            data: Vec::new(),
        }
    }

    pub fn is_end_of_shard(&self) -> bool {
        self.sequence_number == SequenceNumber::EndOfShard
    }

    pub fn stream_partition(&self) -> StreamPartition {
        StreamPartition {
            stream: self.stream.clone(),
            partition_id: self.partition_id.clone(),
        }
    }
}
