//! The uniform seekable-partition client the runner and the supervisor
//! consume. One flavor exists per stream kind plus an in-memory one for
//! tests and local development; all of them sit behind a clonable actor
//! handle so ownership of the underlying client stays in a single task.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::Result;
use crate::message::{StreamPartition, StreamRecord};
use crate::sequence::{PartitionId, SequenceNumber};

/// In-memory partitioned stream used by tests and local development.
pub mod inmemory;

/// Integer-offset flavor backed by a manually-assigned consumer.
pub mod kafka;

/// Opaque-sequence flavor backed by read-ahead shard fetchers.
pub mod kinesis;

/// Operations every seekable partition client supports. Behavior contracts:
/// `assign` replaces the working set and discards unassigned state; `seek`
/// makes the next `poll` return the record at the given sequence (inclusive);
/// probes are non-consuming and report `Some(EndOfShard)` for a closed empty
/// partition or `None` when nothing surfaced within the fetch window;
/// `close` is idempotent.
pub trait RecordSupplier {
    fn name(&self) -> &'static str;

    async fn assign(&mut self, partitions: HashSet<StreamPartition>) -> Result<()>;

    async fn seek(
        &mut self,
        partition: &StreamPartition,
        sequence: &SequenceNumber,
    ) -> Result<()>;

    async fn seek_to_earliest(&mut self, partitions: &[StreamPartition]) -> Result<()>;

    async fn seek_to_latest(&mut self, partitions: &[StreamPartition]) -> Result<()>;

    /// Returns 0..N records within `timeout`. May return empty. Errors during
    /// background fetching never surface here.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<StreamRecord>>;

    async fn earliest_sequence_number(
        &mut self,
        partition: &StreamPartition,
    ) -> Result<Option<SequenceNumber>>;

    async fn latest_sequence_number(
        &mut self,
        partition: &StreamPartition,
    ) -> Result<Option<SequenceNumber>>;

    /// Live partitions of the stream; fails if the stream does not exist.
    async fn partition_ids(&mut self, stream: &str) -> Result<HashSet<PartitionId>>;

    async fn assignment(&mut self) -> Result<HashSet<StreamPartition>>;

    async fn close(&mut self) -> Result<()>;
}

pub enum SupplierType {
    Kafka(kafka::KafkaReader),
    Kinesis(kinesis::KinesisReader),
    InMemory(inmemory::InMemorySupplier),
}

enum ActorMessage {
    Assign {
        partitions: HashSet<StreamPartition>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Seek {
        partition: StreamPartition,
        sequence: SequenceNumber,
        respond_to: oneshot::Sender<Result<()>>,
    },
    SeekToEarliest {
        partitions: Vec<StreamPartition>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    SeekToLatest {
        partitions: Vec<StreamPartition>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Poll {
        timeout: Duration,
        respond_to: oneshot::Sender<Result<Vec<StreamRecord>>>,
    },
    EarliestSequenceNumber {
        partition: StreamPartition,
        respond_to: oneshot::Sender<Result<Option<SequenceNumber>>>,
    },
    LatestSequenceNumber {
        partition: StreamPartition,
        respond_to: oneshot::Sender<Result<Option<SequenceNumber>>>,
    },
    PartitionIds {
        stream: String,
        respond_to: oneshot::Sender<Result<HashSet<PartitionId>>>,
    },
    Assignment {
        respond_to: oneshot::Sender<Result<HashSet<StreamPartition>>>,
    },
    Close {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct SupplierActor<R> {
    receiver: mpsc::Receiver<ActorMessage>,
    supplier: R,
}

impl<R> SupplierActor<R>
where
    R: RecordSupplier,
{
    fn new(receiver: mpsc::Receiver<ActorMessage>, supplier: R) -> Self {
        Self { receiver, supplier }
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Assign {
                partitions,
                respond_to,
            } => {
                let _ = respond_to.send(self.supplier.assign(partitions).await);
            }
            ActorMessage::Seek {
                partition,
                sequence,
                respond_to,
            } => {
                let _ = respond_to.send(self.supplier.seek(&partition, &sequence).await);
            }
            ActorMessage::SeekToEarliest {
                partitions,
                respond_to,
            } => {
                let _ = respond_to.send(self.supplier.seek_to_earliest(&partitions).await);
            }
            ActorMessage::SeekToLatest {
                partitions,
                respond_to,
            } => {
                let _ = respond_to.send(self.supplier.seek_to_latest(&partitions).await);
            }
            ActorMessage::Poll {
                timeout,
                respond_to,
            } => {
                let _ = respond_to.send(self.supplier.poll(timeout).await);
            }
            ActorMessage::EarliestSequenceNumber {
                partition,
                respond_to,
            } => {
                let _ = respond_to.send(self.supplier.earliest_sequence_number(&partition).await);
            }
            ActorMessage::LatestSequenceNumber {
                partition,
                respond_to,
            } => {
                let _ = respond_to.send(self.supplier.latest_sequence_number(&partition).await);
            }
            ActorMessage::PartitionIds { stream, respond_to } => {
                let _ = respond_to.send(self.supplier.partition_ids(&stream).await);
            }
            ActorMessage::Assignment { respond_to } => {
                let _ = respond_to.send(self.supplier.assignment().await);
            }
            ActorMessage::Close { respond_to } => {
                let result = self.supplier.close().await;
                if let Err(e) = &result {
                    error!(?e, "Error while closing record supplier");
                }
                let _ = respond_to.send(result);
            }
        }
    }
}

/// Clonable handle over the supplier actor.
#[derive(Clone)]
pub struct Supplier {
    sender: mpsc::Sender<ActorMessage>,
}

impl Supplier {
    pub fn new(supplier_type: SupplierType) -> Self {
        let (sender, receiver) = mpsc::channel(10);
        match supplier_type {
            SupplierType::Kafka(reader) => {
                tokio::spawn(async move {
                    let mut actor = SupplierActor::new(receiver, reader);
                    while let Some(msg) = actor.receiver.recv().await {
                        actor.handle_message(msg).await;
                    }
                });
            }
            SupplierType::Kinesis(reader) => {
                tokio::spawn(async move {
                    let mut actor = SupplierActor::new(receiver, reader);
                    while let Some(msg) = actor.receiver.recv().await {
                        actor.handle_message(msg).await;
                    }
                });
            }
            SupplierType::InMemory(reader) => {
                tokio::spawn(async move {
                    let mut actor = SupplierActor::new(receiver, reader);
                    while let Some(msg) = actor.receiver.recv().await {
                        actor.handle_message(msg).await;
                    }
                });
            }
        }
        Self { sender }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> ActorMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        // Ignore send errors. If send fails, so does the recv.await below.
        let _ = self.sender.send(make(tx)).await;
        rx.await
            .map_err(|e| crate::Error::ActorPatternRecv(e.to_string()))?
    }

    pub async fn assign(&self, partitions: HashSet<StreamPartition>) -> Result<()> {
        self.call(|tx| ActorMessage::Assign {
            partitions,
            respond_to: tx,
        })
        .await
    }

    pub async fn seek(&self, partition: StreamPartition, sequence: SequenceNumber) -> Result<()> {
        self.call(|tx| ActorMessage::Seek {
            partition,
            sequence,
            respond_to: tx,
        })
        .await
    }

    pub async fn seek_to_earliest(&self, partitions: Vec<StreamPartition>) -> Result<()> {
        self.call(|tx| ActorMessage::SeekToEarliest {
            partitions,
            respond_to: tx,
        })
        .await
    }

    pub async fn seek_to_latest(&self, partitions: Vec<StreamPartition>) -> Result<()> {
        self.call(|tx| ActorMessage::SeekToLatest {
            partitions,
            respond_to: tx,
        })
        .await
    }

    pub async fn poll(&self, timeout: Duration) -> Result<Vec<StreamRecord>> {
        self.call(|tx| ActorMessage::Poll {
            timeout,
            respond_to: tx,
        })
        .await
    }

    pub async fn earliest_sequence_number(
        &self,
        partition: StreamPartition,
    ) -> Result<Option<SequenceNumber>> {
        self.call(|tx| ActorMessage::EarliestSequenceNumber {
            partition,
            respond_to: tx,
        })
        .await
    }

    pub async fn latest_sequence_number(
        &self,
        partition: StreamPartition,
    ) -> Result<Option<SequenceNumber>> {
        self.call(|tx| ActorMessage::LatestSequenceNumber {
            partition,
            respond_to: tx,
        })
        .await
    }

    pub async fn partition_ids(&self, stream: impl Into<String>) -> Result<HashSet<PartitionId>> {
        self.call(|tx| ActorMessage::PartitionIds {
            stream: stream.into(),
            respond_to: tx,
        })
        .await
    }

    pub async fn assignment(&self) -> Result<HashSet<StreamPartition>> {
        self.call(|tx| ActorMessage::Assignment { respond_to: tx }).await
    }

    pub async fn close(&self) -> Result<()> {
        self.call(|tx| ActorMessage::Close { respond_to: tx }).await
    }
}
