//! Seam to the segment-building driver. The driver buffers rows into
//! in-progress segments per sequence name, persists them with a commit
//! snapshot, and hands finished segments over to serving nodes after
//! publish. Building and serving segments is outside this subsystem; the
//! runner only drives the calls below.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::metadata::StreamPartitions;
use crate::{Error, Result};

pub mod inmemory;

/// One parsed input row.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRow {
    pub timestamp: DateTime<Utc>,
    pub payload: Bytes,
}

/// A row that could not be (fully) parsed. `partially_valid` rows made it
/// into a segment with errors; the rest were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub partially_valid: bool,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Turns payload blobs into rows. Schema-aware parsing lives outside this
/// subsystem; the JSON parser below is the default wiring.
pub trait RowParser: Send + Sync {
    fn parse(&self, data: &Bytes) -> std::result::Result<Vec<InputRow>, ParseError>;
}

/// Parses each blob as a JSON object carrying an epoch-millis or RFC 3339
/// timestamp field.
pub struct JsonRowParser {
    timestamp_field: String,
}

impl JsonRowParser {
    pub fn new(timestamp_field: impl Into<String>) -> Self {
        Self {
            timestamp_field: timestamp_field.into(),
        }
    }
}

impl Default for JsonRowParser {
    fn default() -> Self {
        Self::new("timestamp")
    }
}

impl RowParser for JsonRowParser {
    fn parse(&self, data: &Bytes) -> std::result::Result<Vec<InputRow>, ParseError> {
        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| ParseError {
                message: format!("invalid JSON: {e}"),
                partially_valid: false,
            })?;

        let timestamp = match value.get(&self.timestamp_field) {
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        };

        let Some(timestamp) = timestamp else {
            return Err(ParseError {
                message: format!(
                    "row has no usable [{}] field: {}",
                    self.timestamp_field,
                    String::from_utf8_lossy(data)
                ),
                partially_valid: true,
            });
        };

        Ok(vec![InputRow {
            timestamp,
            payload: data.clone(),
        }])
    }
}

/// What the driver reports after buffering one row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddResult {
    /// The active segment crossed its boundary; the sequence should be
    /// checkpointed.
    pub push_required: bool,
    pub persist_required: bool,
}

/// The snapshot persisted alongside segment data so a restarted task knows
/// where to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMetadata {
    pub next_partitions: StreamPartitions,
}

/// Contract of the external appenderator driver. The methods return `Send`
/// futures so the actor can be driven from any task.
pub trait SegmentDriver: Send + 'static {
    /// Recovers locally persisted state; `Some` carries the commit snapshot
    /// of the last persist.
    fn start_job(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Option<CommitMetadata>>> + Send;

    fn add(
        &mut self,
        row: InputRow,
        sequence_name: &str,
        skip_lineage_check: bool,
    ) -> impl std::future::Future<Output = Result<AddResult>> + Send;

    fn persist(
        &mut self,
        commit: CommitMetadata,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Seals and returns the identifiers of all segments built under the
    /// named sequences, removing them from the active set.
    fn publish_segments(
        &mut self,
        sequence_names: &[String],
    ) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;

    /// Registers interest in the serving handoff of published segments. The
    /// returned channel resolves when every segment has been handed off.
    fn register_handoff(
        &mut self,
        segments: Vec<String>,
    ) -> impl std::future::Future<Output = Result<oneshot::Receiver<()>>> + Send;

    fn close(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

enum ActorMessage {
    StartJob {
        respond_to: oneshot::Sender<Result<Option<CommitMetadata>>>,
    },
    Add {
        row: InputRow,
        sequence_name: String,
        skip_lineage_check: bool,
        respond_to: oneshot::Sender<Result<AddResult>>,
    },
    Persist {
        commit: CommitMetadata,
        respond_to: oneshot::Sender<Result<()>>,
    },
    PublishSegments {
        sequence_names: Vec<String>,
        respond_to: oneshot::Sender<Result<Vec<String>>>,
    },
    RegisterHandoff {
        segments: Vec<String>,
        respond_to: oneshot::Sender<Result<oneshot::Receiver<()>>>,
    },
    Close {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct DriverActor<D> {
    receiver: mpsc::Receiver<ActorMessage>,
    driver: D,
}

impl<D: SegmentDriver> DriverActor<D> {
    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::StartJob { respond_to } => {
                let _ = respond_to.send(self.driver.start_job().await);
            }
            ActorMessage::Add {
                row,
                sequence_name,
                skip_lineage_check,
                respond_to,
            } => {
                let _ = respond_to.send(
                    self.driver
                        .add(row, &sequence_name, skip_lineage_check)
                        .await,
                );
            }
            ActorMessage::Persist { commit, respond_to } => {
                let _ = respond_to.send(self.driver.persist(commit).await);
            }
            ActorMessage::PublishSegments {
                sequence_names,
                respond_to,
            } => {
                let _ = respond_to.send(self.driver.publish_segments(&sequence_names).await);
            }
            ActorMessage::RegisterHandoff {
                segments,
                respond_to,
            } => {
                let _ = respond_to.send(self.driver.register_handoff(segments).await);
            }
            ActorMessage::Close { respond_to } => {
                let result = self.driver.close().await;
                if let Err(e) = &result {
                    error!(?e, "Error while closing segment driver");
                }
                let _ = respond_to.send(result);
            }
        }
    }
}

/// Clonable handle over the driver actor; the runner's publish tasks share
/// it with the main loop.
#[derive(Clone)]
pub struct DriverClient {
    sender: mpsc::Sender<ActorMessage>,
}

impl DriverClient {
    pub fn new<D: SegmentDriver>(driver: D) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut actor = DriverActor { receiver, driver };
            while let Some(msg) = actor.receiver.recv().await {
                actor.handle_message(msg).await;
            }
        });
        Self { sender }
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> ActorMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        let _ = self.sender.send(make(tx)).await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    pub async fn start_job(&self) -> Result<Option<CommitMetadata>> {
        self.call(|tx| ActorMessage::StartJob { respond_to: tx }).await
    }

    pub async fn add(
        &self,
        row: InputRow,
        sequence_name: impl Into<String>,
        skip_lineage_check: bool,
    ) -> Result<AddResult> {
        self.call(|tx| ActorMessage::Add {
            row,
            sequence_name: sequence_name.into(),
            skip_lineage_check,
            respond_to: tx,
        })
        .await
    }

    pub async fn persist(&self, commit: CommitMetadata) -> Result<()> {
        self.call(|tx| ActorMessage::Persist {
            commit,
            respond_to: tx,
        })
        .await
    }

    pub async fn publish_segments(&self, sequence_names: Vec<String>) -> Result<Vec<String>> {
        self.call(|tx| ActorMessage::PublishSegments {
            sequence_names,
            respond_to: tx,
        })
        .await
    }

    pub async fn register_handoff(
        &self,
        segments: Vec<String>,
    ) -> Result<oneshot::Receiver<()>> {
        self.call(|tx| ActorMessage::RegisterHandoff {
            segments,
            respond_to: tx,
        })
        .await
    }

    pub async fn close(&self) -> Result<()> {
        self.call(|tx| ActorMessage::Close { respond_to: tx }).await
    }
}
