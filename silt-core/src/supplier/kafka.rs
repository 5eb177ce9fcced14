//! Integer-offset flavor: thin adapter over the `silt-kafka` client.

use std::collections::HashSet;
use std::time::Duration;

use silt_kafka::{KafkaSupplier, TopicPartition};

use crate::message::{StreamPartition, StreamRecord};
use crate::sequence::{PartitionId, SequenceNumber};
use crate::{Error, Result};

pub struct KafkaReader {
    client: KafkaSupplier,
}

impl KafkaReader {
    pub fn new(client: KafkaSupplier) -> Self {
        Self { client }
    }
}

fn to_topic_partition(partition: &StreamPartition) -> Result<TopicPartition> {
    match &partition.partition_id {
        PartitionId::Int(id) => Ok(TopicPartition::new(partition.stream.clone(), *id)),
        PartitionId::Str(id) => Err(Error::Supplier(format!(
            "integer-offset stream cannot address partition [{id}]"
        ))),
    }
}

fn to_topic_partitions(partitions: &[StreamPartition]) -> Result<Vec<TopicPartition>> {
    partitions.iter().map(to_topic_partition).collect()
}

impl super::RecordSupplier for KafkaReader {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn assign(&mut self, partitions: HashSet<StreamPartition>) -> Result<()> {
        let partitions: Vec<_> = partitions.iter().cloned().collect();
        let topic_partitions = to_topic_partitions(&partitions)?;
        self.client.assign(topic_partitions).await?;
        Ok(())
    }

    async fn seek(
        &mut self,
        partition: &StreamPartition,
        sequence: &SequenceNumber,
    ) -> Result<()> {
        let SequenceNumber::Int(offset) = sequence else {
            return Err(Error::Supplier(format!(
                "cannot seek integer-offset partition to [{sequence}]"
            )));
        };
        self.client.seek(to_topic_partition(partition)?, *offset).await?;
        Ok(())
    }

    async fn seek_to_earliest(&mut self, partitions: &[StreamPartition]) -> Result<()> {
        self.client
            .seek_to_earliest(to_topic_partitions(partitions)?)
            .await?;
        Ok(())
    }

    async fn seek_to_latest(&mut self, partitions: &[StreamPartition]) -> Result<()> {
        self.client
            .seek_to_latest(to_topic_partitions(partitions)?)
            .await?;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<StreamRecord>> {
        let records = self.client.poll(timeout).await?;
        Ok(records
            .into_iter()
            .map(|r| {
                StreamRecord::new(
                    r.topic,
                    r.partition,
                    SequenceNumber::Int(r.offset),
                    vec![r.payload],
                )
            })
            .collect())
    }

    async fn earliest_sequence_number(
        &mut self,
        partition: &StreamPartition,
    ) -> Result<Option<SequenceNumber>> {
        let (earliest, _) = self.client.watermarks(to_topic_partition(partition)?).await?;
        Ok(Some(SequenceNumber::Int(earliest)))
    }

    async fn latest_sequence_number(
        &mut self,
        partition: &StreamPartition,
    ) -> Result<Option<SequenceNumber>> {
        let (_, latest) = self.client.watermarks(to_topic_partition(partition)?).await?;
        Ok(Some(SequenceNumber::Int(latest)))
    }

    async fn partition_ids(&mut self, stream: &str) -> Result<HashSet<PartitionId>> {
        let ids = self.client.partition_ids(stream).await?;
        Ok(ids.into_iter().map(PartitionId::Int).collect())
    }

    async fn assignment(&mut self) -> Result<HashSet<StreamPartition>> {
        let assignment = self.client.assignment().await?;
        Ok(assignment
            .into_iter()
            .map(|tp| StreamPartition::new(tp.topic, tp.partition))
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.client.close().await;
        Ok(())
    }
}
