//! A partitioned stream held in memory, with the same seek/poll/probe
//! semantics as the real flavors. Partitions use integer sequence numbers,
//! can be trimmed from the front (retention) and sealed (shard close).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::message::{StreamPartition, StreamRecord};
use crate::sequence::{PartitionId, SequenceNumber};
use crate::{Error, Result};

const MAX_RECORDS_PER_POLL: usize = 100;

#[derive(Debug, Default)]
struct PartitionState {
    /// Sequence number of the first retained record.
    trim_offset: i64,
    records: Vec<Bytes>,
    closed: bool,
}

impl PartitionState {
    /// Sequence number one past the last appended record.
    fn head(&self) -> i64 {
        self.trim_offset + self.records.len() as i64
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    streams: HashMap<String, BTreeMap<PartitionId, PartitionState>>,
}

/// Shared backing store; clones see the same streams.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStreamStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_stream(&self, stream: impl Into<String>, partitions: Vec<PartitionId>) {
        let mut inner = self.inner.lock().expect("stream store lock");
        let entry = inner.streams.entry(stream.into()).or_default();
        for partition in partitions {
            entry.entry(partition).or_default();
        }
    }

    /// Appends one record and returns its sequence number.
    pub fn append(&self, stream: &str, partition: &PartitionId, payload: Bytes) -> i64 {
        let mut inner = self.inner.lock().expect("stream store lock");
        let state = inner
            .streams
            .get_mut(stream)
            .and_then(|partitions| partitions.get_mut(partition))
            .expect("append to unknown partition");
        assert!(!state.closed, "append to closed partition");
        let sequence = state.head();
        state.records.push(payload);
        sequence
    }

    /// Seals a partition; readers that drain it observe an end-of-shard
    /// marker.
    pub fn close_partition(&self, stream: &str, partition: &PartitionId) {
        let mut inner = self.inner.lock().expect("stream store lock");
        if let Some(state) = inner
            .streams
            .get_mut(stream)
            .and_then(|partitions| partitions.get_mut(partition))
        {
            state.closed = true;
        }
    }

    /// Drops records below `up_to`, moving the retention bound forward.
    pub fn trim(&self, stream: &str, partition: &PartitionId, up_to: i64) {
        let mut inner = self.inner.lock().expect("stream store lock");
        if let Some(state) = inner
            .streams
            .get_mut(stream)
            .and_then(|partitions| partitions.get_mut(partition))
        {
            let drop_count = (up_to - state.trim_offset).clamp(0, state.records.len() as i64);
            state.records.drain(..drop_count as usize);
            state.trim_offset += drop_count;
        }
    }
}

#[derive(Debug, Default)]
struct Cursor {
    next: i64,
    end_of_shard_delivered: bool,
}

pub struct InMemorySupplier {
    store: InMemoryStreamStore,
    cursors: BTreeMap<StreamPartition, Cursor>,
    closed: bool,
}

impl InMemorySupplier {
    pub fn new(store: InMemoryStreamStore) -> Self {
        Self {
            store,
            cursors: BTreeMap::new(),
            closed: false,
        }
    }

    fn cursor_mut(&mut self, partition: &StreamPartition) -> Result<&mut Cursor> {
        self.cursors.get_mut(partition).ok_or_else(|| {
            Error::Supplier(format!("partition {partition} has not been assigned"))
        })
    }

    fn gather(&mut self) -> Vec<StreamRecord> {
        let mut records = Vec::new();
        let inner = self.store.inner.lock().expect("stream store lock");
        for (partition, cursor) in &mut self.cursors {
            if records.len() >= MAX_RECORDS_PER_POLL {
                break;
            }
            let Some(state) = inner
                .streams
                .get(&partition.stream)
                .and_then(|partitions| partitions.get(&partition.partition_id))
            else {
                continue;
            };

            while cursor.next < state.head() && records.len() < MAX_RECORDS_PER_POLL {
                let index = (cursor.next - state.trim_offset) as usize;
                records.push(StreamRecord::new(
                    partition.stream.clone(),
                    partition.partition_id.clone(),
                    SequenceNumber::Int(cursor.next),
                    vec![state.records[index].clone()],
                ));
                cursor.next += 1;
            }

            if state.closed && cursor.next >= state.head() && !cursor.end_of_shard_delivered {
                records.push(StreamRecord::end_of_shard(
                    partition.stream.clone(),
                    partition.partition_id.clone(),
                ));
                cursor.end_of_shard_delivered = true;
            }
        }
        records
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Supplier("supplier already closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl super::RecordSupplier for InMemorySupplier {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn assign(&mut self, partitions: HashSet<StreamPartition>) -> Result<()> {
        self.check_open()?;
        self.cursors.retain(|partition, _| partitions.contains(partition));
        for partition in partitions {
            self.cursors.entry(partition).or_default();
        }
        Ok(())
    }

    async fn seek(
        &mut self,
        partition: &StreamPartition,
        sequence: &SequenceNumber,
    ) -> Result<()> {
        self.check_open()?;
        let SequenceNumber::Int(offset) = sequence else {
            return Err(Error::Supplier(format!(
                "cannot seek to non-integer sequence [{sequence}]"
            )));
        };
        let offset = *offset;
        let cursor = self.cursor_mut(partition)?;
        cursor.next = offset;
        cursor.end_of_shard_delivered = false;
        Ok(())
    }

    async fn seek_to_earliest(&mut self, partitions: &[StreamPartition]) -> Result<()> {
        self.check_open()?;
        for partition in partitions {
            let earliest = {
                let inner = self.store.inner.lock().expect("stream store lock");
                inner
                    .streams
                    .get(&partition.stream)
                    .and_then(|p| p.get(&partition.partition_id))
                    .map(|state| state.trim_offset)
                    .unwrap_or(0)
            };
            let cursor = self.cursor_mut(partition)?;
            cursor.next = earliest;
            cursor.end_of_shard_delivered = false;
        }
        Ok(())
    }

    async fn seek_to_latest(&mut self, partitions: &[StreamPartition]) -> Result<()> {
        self.check_open()?;
        for partition in partitions {
            let head = {
                let inner = self.store.inner.lock().expect("stream store lock");
                inner
                    .streams
                    .get(&partition.stream)
                    .and_then(|p| p.get(&partition.partition_id))
                    .map(|state| state.head())
                    .unwrap_or(0)
            };
            let cursor = self.cursor_mut(partition)?;
            cursor.next = head;
            cursor.end_of_shard_delivered = false;
        }
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<StreamRecord>> {
        self.check_open()?;
        let records = self.gather();
        if !records.is_empty() {
            return Ok(records);
        }
        tokio::time::sleep(timeout).await;
        Ok(self.gather())
    }

    async fn earliest_sequence_number(
        &mut self,
        partition: &StreamPartition,
    ) -> Result<Option<SequenceNumber>> {
        self.check_open()?;
        let inner = self.store.inner.lock().expect("stream store lock");
        let Some(state) = inner
            .streams
            .get(&partition.stream)
            .and_then(|p| p.get(&partition.partition_id))
        else {
            return Ok(None);
        };
        if state.closed && state.records.is_empty() {
            return Ok(Some(SequenceNumber::EndOfShard));
        }
        Ok(Some(SequenceNumber::Int(state.trim_offset)))
    }

    async fn latest_sequence_number(
        &mut self,
        partition: &StreamPartition,
    ) -> Result<Option<SequenceNumber>> {
        self.check_open()?;
        let inner = self.store.inner.lock().expect("stream store lock");
        let Some(state) = inner
            .streams
            .get(&partition.stream)
            .and_then(|p| p.get(&partition.partition_id))
        else {
            return Ok(None);
        };
        if state.closed && state.records.is_empty() {
            return Ok(Some(SequenceNumber::EndOfShard));
        }
        Ok(Some(SequenceNumber::Int(state.head())))
    }

    async fn partition_ids(&mut self, stream: &str) -> Result<HashSet<PartitionId>> {
        self.check_open()?;
        let inner = self.store.inner.lock().expect("stream store lock");
        let Some(partitions) = inner.streams.get(stream) else {
            return Err(Error::Supplier(format!("stream [{stream}] not found")));
        };
        Ok(partitions.keys().cloned().collect())
    }

    async fn assignment(&mut self) -> Result<HashSet<StreamPartition>> {
        self.check_open()?;
        Ok(self.cursors.keys().cloned().collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.cursors.clear();
        Ok(())
    }
}
