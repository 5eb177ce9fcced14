//! Integer-offset stream client used by the ingestion runner and the
//! supervisor. One consumer, manually assigned — partition placement is
//! decided upstream, so there is no consumer group rebalancing and offsets
//! are never committed to the broker; the metadata store is the only source
//! of committed positions.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::Offset;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::stream_consumer::StreamConsumer;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("Topic {0} not found in broker metadata")]
    TopicNotFound(String),

    #[error("Partition {topic}/{partition} is not assigned")]
    NotAssigned { topic: String, partition: i32 },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KafkaSupplierConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// Optional prefix for the generated consumer group id. The group is
    /// only used for broker-side bookkeeping; offsets are never committed.
    pub group_id_prefix: String,
    /// Any supported kafka client configuration options from
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub kafka_raw_config: HashMap<String, String>,
}

/// A record read from one assigned partition.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

struct SupplierContext;

impl ClientContext for SupplierContext {}

impl ConsumerContext for SupplierContext {
    fn pre_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        // manual assignment; rebalances only fire on assign() calls
        debug!("Pre rebalance {:?}", rebalance);
    }

    fn post_rebalance(&self, _: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        debug!("Post rebalance {:?}", rebalance);
    }
}

type SupplierConsumer = StreamConsumer<SupplierContext>;

enum ActorMessage {
    Assign {
        partitions: Vec<TopicPartition>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Seek {
        partition: TopicPartition,
        offset: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    SeekToEarliest {
        partitions: Vec<TopicPartition>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    SeekToLatest {
        partitions: Vec<TopicPartition>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Poll {
        timeout: Duration,
        respond_to: oneshot::Sender<Result<Vec<KafkaRecord>>>,
    },
    Position {
        partition: TopicPartition,
        respond_to: oneshot::Sender<Result<Option<i64>>>,
    },
    Watermarks {
        partition: TopicPartition,
        respond_to: oneshot::Sender<Result<(i64, i64)>>,
    },
    PartitionIds {
        topic: String,
        respond_to: oneshot::Sender<Result<Vec<i32>>>,
    },
    Assignment {
        respond_to: oneshot::Sender<Result<Vec<TopicPartition>>>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

struct KafkaSupplierActor {
    consumer: SupplierConsumer,
    /// Desired position per assigned partition; reapplied on every
    /// assignment change since seeks are expressed through assign().
    assignment: HashMap<TopicPartition, Offset>,
    handler_rx: mpsc::Receiver<ActorMessage>,
    metadata_timeout: Duration,
}

impl KafkaSupplierActor {
    fn start(config: KafkaSupplierConfig, handler_rx: mpsc::Receiver<ActorMessage>) -> Result<()> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("metadata.max.age.ms", "10000")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest");

        if !config.kafka_raw_config.is_empty() {
            info!(
                "Applying user-specified kafka config: {}",
                config
                    .kafka_raw_config
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<String>>()
                    .join(", ")
            );
            for (key, value) in config.kafka_raw_config {
                client_config.set(key, value);
            }
        }

        client_config
            .set("group.id", random_group_id(&config.group_id_prefix))
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.auto.commit", "false")
            .set_log_level(RDKafkaLogLevel::Warning);

        let consumer: SupplierConsumer = client_config
            .create_with_context(SupplierContext)
            .map_err(|err| Error::Connection {
                server: config.brokers.join(","),
                error: err.to_string(),
            })?;

        let mut actor = KafkaSupplierActor {
            consumer,
            assignment: HashMap::new(),
            handler_rx,
            metadata_timeout: Duration::from_secs(5),
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok(())
    }

    async fn run(&mut self) {
        while let Some(msg) = self.handler_rx.recv().await {
            if self.handle_message(msg).await {
                break;
            }
        }
    }

    /// Returns true once the supplier is closed and the actor should stop.
    async fn handle_message(&mut self, msg: ActorMessage) -> bool {
        match msg {
            ActorMessage::Assign {
                partitions,
                respond_to,
            } => {
                let _ = respond_to.send(self.assign(partitions));
            }
            ActorMessage::Seek {
                partition,
                offset,
                respond_to,
            } => {
                let _ = respond_to.send(self.seek(partition, Offset::Offset(offset)));
            }
            ActorMessage::SeekToEarliest {
                partitions,
                respond_to,
            } => {
                let _ = respond_to.send(self.seek_all(partitions, Offset::Beginning));
            }
            ActorMessage::SeekToLatest {
                partitions,
                respond_to,
            } => {
                let _ = respond_to.send(self.seek_all(partitions, Offset::End));
            }
            ActorMessage::Poll {
                timeout,
                respond_to,
            } => {
                let records = self.poll(timeout).await;
                let _ = respond_to.send(records);
            }
            ActorMessage::Position {
                partition,
                respond_to,
            } => {
                let _ = respond_to.send(self.position(partition));
            }
            ActorMessage::Watermarks {
                partition,
                respond_to,
            } => {
                let _ = respond_to.send(self.watermarks(partition));
            }
            ActorMessage::PartitionIds { topic, respond_to } => {
                let _ = respond_to.send(self.partition_ids(&topic));
            }
            ActorMessage::Assignment { respond_to } => {
                let _ = respond_to.send(Ok(self.assignment.keys().cloned().collect()));
            }
            ActorMessage::Close { respond_to } => {
                self.assignment.clear();
                let _ = self.consumer.unassign();
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }

    fn apply_assignment(&mut self) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for (tp, offset) in &self.assignment {
            tpl.add_partition_offset(&tp.topic, tp.partition, *offset)
                .map_err(|e| Error::Kafka(format!("Failed to build assignment: {e}")))?;
        }
        self.consumer
            .assign(&tpl)
            .map_err(|e| Error::Kafka(format!("Failed to assign partitions: {e}")))
    }

    fn assign(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        let mut next: HashMap<TopicPartition, Offset> = HashMap::new();
        for tp in partitions {
            // keep the position of partitions that stay assigned
            let offset = self
                .assignment
                .get(&tp)
                .copied()
                .unwrap_or(Offset::Beginning);
            next.insert(tp, offset);
        }
        self.assignment = next;
        self.apply_assignment()
    }

    fn seek(&mut self, partition: TopicPartition, offset: Offset) -> Result<()> {
        let Some(entry) = self.assignment.get_mut(&partition) else {
            return Err(Error::NotAssigned {
                topic: partition.topic,
                partition: partition.partition,
            });
        };
        *entry = offset;
        self.apply_assignment()
    }

    fn seek_all(&mut self, partitions: Vec<TopicPartition>, offset: Offset) -> Result<()> {
        for tp in partitions {
            let Some(entry) = self.assignment.get_mut(&tp) else {
                return Err(Error::NotAssigned {
                    topic: tp.topic,
                    partition: tp.partition,
                });
            };
            *entry = offset;
        }
        self.apply_assignment()
    }

    async fn poll(&mut self, poll_timeout: Duration) -> Result<Vec<KafkaRecord>> {
        let mut records: Vec<KafkaRecord> = vec![];
        if self.assignment.is_empty() {
            return Ok(records);
        }

        let timeout = tokio::time::timeout(poll_timeout, std::future::pending::<()>());
        tokio::pin!(timeout);
        loop {
            tokio::select! {
                biased;

                _ = &mut timeout => {
                    break;
                }

                message = self.consumer.recv() => {
                    let message = match message {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(?e, "Transient failure while polling records");
                            break;
                        }
                    };

                    let payload = match message.payload() {
                        Some(payload) => Bytes::copy_from_slice(payload),
                        None => Bytes::new(),
                    };

                    let record = KafkaRecord {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        payload,
                    };

                    // the next poll resumes after what we just handed out
                    self.assignment.insert(
                        TopicPartition::new(record.topic.clone(), record.partition),
                        Offset::Offset(record.offset + 1),
                    );

                    records.push(record);
                }
            }
        }
        debug!(record_count = records.len(), "Polled records from Kafka");
        Ok(records)
    }

    fn position(&self, partition: TopicPartition) -> Result<Option<i64>> {
        if !self.assignment.contains_key(&partition) {
            return Err(Error::NotAssigned {
                topic: partition.topic,
                partition: partition.partition,
            });
        }
        let tpl = self
            .consumer
            .position()
            .map_err(|e| Error::Kafka(format!("Failed to fetch position: {e}")))?;
        let elem = tpl
            .find_partition(&partition.topic, partition.partition)
            .map(|e| e.offset());
        Ok(match elem {
            Some(Offset::Offset(o)) => Some(o),
            _ => None,
        })
    }

    fn watermarks(&self, partition: TopicPartition) -> Result<(i64, i64)> {
        self.consumer
            .fetch_watermarks(&partition.topic, partition.partition, self.metadata_timeout)
            .map_err(|e| Error::Kafka(format!("Failed to fetch watermarks: {e}")))
    }

    fn partition_ids(&self, topic: &str) -> Result<Vec<i32>> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), self.metadata_timeout)
            .map_err(|e| Error::Kafka(format!("Failed to fetch metadata: {e}")))?;

        let Some(topic_metadata) = metadata.topics().iter().find(|t| t.name() == topic) else {
            return Err(Error::TopicNotFound(topic.to_string()));
        };
        if topic_metadata.partitions().is_empty() {
            return Err(Error::TopicNotFound(topic.to_string()));
        }
        Ok(topic_metadata
            .partitions()
            .iter()
            .map(|p| p.id())
            .collect())
    }
}

/// Clonable handle over the consumer actor.
#[derive(Clone)]
pub struct KafkaSupplier {
    actor_tx: mpsc::Sender<ActorMessage>,
}

impl KafkaSupplier {
    pub fn connect(config: KafkaSupplierConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);
        KafkaSupplierActor::start(config, rx)?;
        Ok(Self { actor_tx: tx })
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> ActorMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        let _ = self.actor_tx.send(make(tx)).await;
        rx.await
            .map_err(|_| Error::Other("Actor task terminated".into()))?
    }

    pub async fn assign(&self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.call(|tx| ActorMessage::Assign {
            partitions,
            respond_to: tx,
        })
        .await
    }

    pub async fn seek(&self, partition: TopicPartition, offset: i64) -> Result<()> {
        self.call(|tx| ActorMessage::Seek {
            partition,
            offset,
            respond_to: tx,
        })
        .await
    }

    pub async fn seek_to_earliest(&self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.call(|tx| ActorMessage::SeekToEarliest {
            partitions,
            respond_to: tx,
        })
        .await
    }

    pub async fn seek_to_latest(&self, partitions: Vec<TopicPartition>) -> Result<()> {
        self.call(|tx| ActorMessage::SeekToLatest {
            partitions,
            respond_to: tx,
        })
        .await
    }

    pub async fn poll(&self, timeout: Duration) -> Result<Vec<KafkaRecord>> {
        self.call(|tx| ActorMessage::Poll {
            timeout,
            respond_to: tx,
        })
        .await
    }

    pub async fn position(&self, partition: TopicPartition) -> Result<Option<i64>> {
        self.call(|tx| ActorMessage::Position {
            partition,
            respond_to: tx,
        })
        .await
    }

    /// `(earliest, latest)` offsets currently retained for the partition.
    pub async fn watermarks(&self, partition: TopicPartition) -> Result<(i64, i64)> {
        self.call(|tx| ActorMessage::Watermarks {
            partition,
            respond_to: tx,
        })
        .await
    }

    pub async fn partition_ids(&self, topic: impl Into<String>) -> Result<Vec<i32>> {
        self.call(|tx| ActorMessage::PartitionIds {
            topic: topic.into(),
            respond_to: tx,
        })
        .await
    }

    pub async fn assignment(&self) -> Result<Vec<TopicPartition>> {
        self.call(|tx| ActorMessage::Assignment { respond_to: tx })
            .await
    }

    /// Idempotent; subsequent calls are no-ops once the actor has stopped.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.actor_tx.send(ActorMessage::Close { respond_to: tx }).await;
        let _ = rx.await;
    }
}

fn random_group_id(prefix: &str) -> String {
    use rand::Rng;
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{prefix}-{suffix}")
}
