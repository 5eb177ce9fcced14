//! Opaque-sequence flavor: adapter over the `silt-kinesis` client. Closed
//! shards surface as end-of-shard marker records and probe results.

use std::collections::HashSet;
use std::time::Duration;

use silt_kinesis::{KinesisSupplier, SequenceProbe, ShardPartition};

use crate::message::{StreamPartition, StreamRecord};
use crate::sequence::{PartitionId, SequenceNumber};
use crate::{Error, Result};

pub struct KinesisReader {
    client: KinesisSupplier,
}

impl KinesisReader {
    pub fn new(client: KinesisSupplier) -> Self {
        Self { client }
    }
}

fn to_shard(partition: &StreamPartition) -> ShardPartition {
    ShardPartition::new(partition.stream.clone(), partition.partition_id.as_key())
}

fn to_shards(partitions: &[StreamPartition]) -> Vec<ShardPartition> {
    partitions.iter().map(to_shard).collect()
}

fn sequence_str(sequence: &SequenceNumber) -> Result<&str> {
    match sequence {
        SequenceNumber::Str(s) => Ok(s),
        other => Err(Error::Supplier(format!(
            "cannot seek opaque-sequence partition to [{other}]"
        ))),
    }
}

fn from_probe(probe: SequenceProbe) -> Option<SequenceNumber> {
    match probe {
        SequenceProbe::At(sequence) => Some(SequenceNumber::Str(sequence)),
        SequenceProbe::ShardClosed => Some(SequenceNumber::EndOfShard),
        SequenceProbe::TimedOut => None,
    }
}

impl super::RecordSupplier for KinesisReader {
    fn name(&self) -> &'static str {
        "kinesis"
    }

    async fn assign(&mut self, partitions: HashSet<StreamPartition>) -> Result<()> {
        let shards = partitions.iter().map(to_shard).collect();
        self.client.assign(shards).await?;
        Ok(())
    }

    async fn seek(
        &mut self,
        partition: &StreamPartition,
        sequence: &SequenceNumber,
    ) -> Result<()> {
        self.client
            .seek(&to_shard(partition), sequence_str(sequence)?)
            .await?;
        Ok(())
    }

    async fn seek_to_earliest(&mut self, partitions: &[StreamPartition]) -> Result<()> {
        self.client.seek_to_earliest(&to_shards(partitions)).await?;
        Ok(())
    }

    async fn seek_to_latest(&mut self, partitions: &[StreamPartition]) -> Result<()> {
        self.client.seek_to_latest(&to_shards(partitions)).await?;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<StreamRecord>> {
        let records = self.client.poll(timeout).await?;
        Ok(records
            .into_iter()
            .map(|r| match r.sequence_number {
                Some(sequence) => StreamRecord::new(
                    r.stream,
                    r.shard_id.as_str(),
                    SequenceNumber::Str(sequence),
                    r.data,
                ),
                None => StreamRecord::end_of_shard(r.stream, r.shard_id.as_str()),
            })
            .collect())
    }

    async fn earliest_sequence_number(
        &mut self,
        partition: &StreamPartition,
    ) -> Result<Option<SequenceNumber>> {
        let probe = self.client.earliest_sequence_number(&to_shard(partition)).await?;
        Ok(from_probe(probe))
    }

    async fn latest_sequence_number(
        &mut self,
        partition: &StreamPartition,
    ) -> Result<Option<SequenceNumber>> {
        let probe = self.client.latest_sequence_number(&to_shard(partition)).await?;
        Ok(from_probe(probe))
    }

    async fn partition_ids(&mut self, stream: &str) -> Result<HashSet<PartitionId>> {
        let ids = self.client.partition_ids(stream).await?;
        Ok(ids.into_iter().map(PartitionId::Str).collect())
    }

    async fn assignment(&mut self) -> Result<HashSet<StreamPartition>> {
        Ok(self
            .client
            .assignment()
            .into_iter()
            .map(|shard| StreamPartition::new(shard.stream, shard.shard_id.as_str()))
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.client.close().await;
        Ok(())
    }
}
