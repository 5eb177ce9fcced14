//! Metadata-store actions. The store is the single resource shared across
//! tasks: a publish is a compare-and-swap on the stored offset commit, so at
//! most one of two racing publishes with the same expected start wins.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::Result;
use crate::metadata::DataSourceMetadata;

/// Payload of the transactional publish: the segments to commit plus the
/// offset-commit transition they depend on. `start_metadata`/`end_metadata`
/// are absent when the task runs without transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTransactionalInsert {
    pub segments: Vec<String>,
    pub start_metadata: Option<DataSourceMetadata>,
    pub end_metadata: Option<DataSourceMetadata>,
}

/// A task-initiated checkpoint: the supervisor verifies it and fans the
/// current offsets out to the group's replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointNotice {
    pub datasource: String,
    pub task_group_id: i32,
    pub base_sequence_name: String,
    pub start_metadata: DataSourceMetadata,
    pub current_metadata: DataSourceMetadata,
}

/// Actions a task or supervisor submits against the metadata store. The
/// methods return `Send` futures because publish tasks run off the caller's
/// task.
pub trait MetadataActionClient: Send + Sync + 'static {
    /// Commits `segments` and advances the stored offset commit iff the
    /// current stored commit matches `start_metadata`. Returns whether the
    /// transaction was accepted.
    fn segment_transactional_insert(
        &self,
        datasource: &str,
        action: SegmentTransactionalInsert,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn checkpoint(
        &self,
        notice: CheckpointNotice,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// `None` deletes the stored commit outright; `Some` removes exactly the
    /// named partitions from it.
    fn reset_metadata(
        &self,
        datasource: &str,
        metadata: Option<DataSourceMetadata>,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// The stored offset commit, if any.
    fn get_metadata(
        &self,
        datasource: &str,
    ) -> impl std::future::Future<Output = Result<Option<DataSourceMetadata>>> + Send;
}

/// Offset-commit store held in memory, with the same compare-and-swap
/// semantics the SQL-backed store provides.
#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    commits: Arc<Mutex<HashMap<String, DataSourceMetadata>>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, datasource: &str) -> Option<DataSourceMetadata> {
        self.commits.lock().await.get(datasource).cloned()
    }

    pub async fn put(&self, datasource: impl Into<String>, metadata: DataSourceMetadata) {
        self.commits.lock().await.insert(datasource.into(), metadata);
    }

    /// Advances the commit to `stored.plus(end)` iff the stored commit
    /// matches `expected_start` (both absent counts as a match).
    pub async fn compare_and_swap(
        &self,
        datasource: &str,
        expected_start: Option<&DataSourceMetadata>,
        end: &DataSourceMetadata,
    ) -> bool {
        let mut commits = self.commits.lock().await;
        let stored = commits.get(datasource);

        let matches = match (stored, expected_start) {
            // first commit for the datasource; any start is valid
            (None, _) => true,
            (Some(stored), Some(expected)) => stored.matches(expected),
            (Some(_), None) => false,
        };
        if !matches {
            warn!(
                datasource,
                ?stored,
                ?expected_start,
                "Rejecting commit, stored metadata does not match expected start"
            );
            return false;
        }

        let next = match stored {
            Some(stored) => stored.plus(end),
            None => end.clone(),
        };
        commits.insert(datasource.to_string(), next);
        true
    }

    pub async fn reset(
        &self,
        datasource: &str,
        metadata: Option<&DataSourceMetadata>,
    ) -> bool {
        let mut commits = self.commits.lock().await;
        match metadata {
            None => {
                commits.remove(datasource);
                true
            }
            Some(subset) => match commits.get(datasource) {
                Some(stored) => {
                    let next = stored.minus(subset);
                    commits.insert(datasource.to_string(), next);
                    true
                }
                None => false,
            },
        }
    }
}

/// Action client wired to the in-memory store; checkpoint notices are
/// forwarded to the registered supervisor mailbox, if any.
#[derive(Clone)]
pub struct InMemoryActionClient {
    store: InMemoryMetadataStore,
    checkpoint_tx: Option<tokio::sync::mpsc::Sender<CheckpointNotice>>,
    published: Arc<Mutex<Vec<SegmentTransactionalInsert>>>,
}

impl InMemoryActionClient {
    pub fn new(store: InMemoryMetadataStore) -> Self {
        Self {
            store,
            checkpoint_tx: None,
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_checkpoint_mailbox(
        mut self,
        tx: tokio::sync::mpsc::Sender<CheckpointNotice>,
    ) -> Self {
        self.checkpoint_tx = Some(tx);
        self
    }

    pub fn store(&self) -> &InMemoryMetadataStore {
        &self.store
    }

    /// Accepted transactional inserts, in commit order.
    pub async fn published(&self) -> Vec<SegmentTransactionalInsert> {
        self.published.lock().await.clone()
    }
}

impl MetadataActionClient for InMemoryActionClient {
    async fn segment_transactional_insert(
        &self,
        datasource: &str,
        action: SegmentTransactionalInsert,
    ) -> Result<bool> {
        let accepted = match (&action.start_metadata, &action.end_metadata) {
            (start, Some(end)) => {
                self.store
                    .compare_and_swap(datasource, start.as_ref(), end)
                    .await
            }
            // non-transactional publish: segments commit unconditionally
            _ => true,
        };
        if accepted {
            info!(
                datasource,
                segment_count = action.segments.len(),
                "Committed segments"
            );
            self.published.lock().await.push(action);
        }
        Ok(accepted)
    }

    async fn checkpoint(&self, notice: CheckpointNotice) -> Result<bool> {
        match &self.checkpoint_tx {
            Some(tx) => Ok(tx.send(notice).await.is_ok()),
            None => Ok(true),
        }
    }

    async fn reset_metadata(
        &self,
        datasource: &str,
        metadata: Option<DataSourceMetadata>,
    ) -> Result<bool> {
        Ok(self.store.reset(datasource, metadata.as_ref()).await)
    }

    async fn get_metadata(&self, datasource: &str) -> Result<Option<DataSourceMetadata>> {
        Ok(self.store.get(datasource).await)
    }
}
