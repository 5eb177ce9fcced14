//! Supervisor behavior tests against an in-process cluster: submitted tasks
//! run real runners over the shared in-memory stream, metadata store and
//! segment driver, and the chat client talks straight to their handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::client::{TaskClient, TaskQueue, TaskState, TaskSummary};
use super::*;
use crate::actions::{CheckpointNotice, InMemoryActionClient, InMemoryMetadataStore};
use crate::config::task::{TaskConfig, TaskTuningConfig};
use crate::driver::inmemory::InMemoryDriver;
use crate::driver::{DriverClient, JsonRowParser};
use crate::metadata::StreamKind;
use crate::runner::sequences::OffsetMap;
use crate::runner::{
    NoopAnnouncer, PauseOutcome, RunnerHandle, SetEndOutcome, Status, TaskOutcome, TaskReport,
    TaskRunner,
};
use crate::supplier::inmemory::{InMemoryStreamStore, InMemorySupplier};
use crate::supplier::{Supplier, SupplierType};

const STREAM: &str = "events";
const DATASOURCE: &str = "ds";

fn int_offsets(entries: &[(i32, i64)]) -> OffsetMap {
    entries
        .iter()
        .map(|(p, s)| (PartitionId::Int(*p), SequenceNumber::Int(*s)))
        .collect()
}

fn payload(index: i64) -> Bytes {
    Bytes::from(format!(
        "{{\"timestamp\": {}, \"value\": {index}}}",
        1_700_000_000_000_i64 + index
    ))
}

fn kafka_meta(entries: &[(i32, i64)]) -> DataSourceMetadata {
    DataSourceMetadata::new(
        StreamKind::Kafka,
        StreamPartitions::new(STREAM, int_offsets(entries)),
    )
}

struct ClusterTask {
    config: TaskConfig,
    handle: RunnerHandle,
    join: Option<JoinHandle<TaskReport>>,
    report: Option<TaskReport>,
    forced_failed: bool,
    _dir: TempDir,
}

/// Orchestrator stand-in: spawns real runners for submitted configs.
#[derive(Clone)]
struct InProcessCluster {
    inner: Arc<tokio::sync::Mutex<HashMap<String, ClusterTask>>>,
    store: InMemoryStreamStore,
    metadata: InMemoryMetadataStore,
    checkpoint_tx: mpsc::Sender<CheckpointNotice>,
    max_rows_per_segment: usize,
}

impl InProcessCluster {
    fn new(
        store: InMemoryStreamStore,
        metadata: InMemoryMetadataStore,
        checkpoint_tx: mpsc::Sender<CheckpointNotice>,
        max_rows_per_segment: usize,
    ) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            store,
            metadata,
            checkpoint_tx,
            max_rows_per_segment,
        }
    }

    async fn refresh(&self) {
        let mut inner = self.inner.lock().await;
        for task in inner.values_mut() {
            if task.report.is_none()
                && task.join.as_ref().is_some_and(|join| join.is_finished())
            {
                let join = task.join.take().expect("join checked above");
                task.report = join.await.ok();
            }
        }
    }

    fn state_of(task: &ClusterTask) -> TaskState {
        if task.forced_failed {
            return TaskState::Failed;
        }
        match &task.report {
            Some(report) => match report.outcome {
                TaskOutcome::Success => TaskState::Success,
                TaskOutcome::Failure => TaskState::Failed,
            },
            None => TaskState::Running,
        }
    }

    async fn handle_of(&self, task_id: &str) -> crate::Result<RunnerHandle> {
        self.inner
            .lock()
            .await
            .get(task_id)
            .map(|task| task.handle.clone())
            .ok_or_else(|| Error::Supervisor(format!("unknown task [{task_id}]")))
    }

    async fn ids_in_state(&self, state: TaskState) -> Vec<String> {
        self.refresh().await;
        self.inner
            .lock()
            .await
            .iter()
            .filter(|(_, task)| Self::state_of(task) == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn submission_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    async fn task_config(&self, task_id: &str) -> Option<TaskConfig> {
        self.inner
            .lock()
            .await
            .get(task_id)
            .map(|task| task.config.clone())
    }

    /// Simulates an abrupt replica death: the runner is aborted and the
    /// orchestrator reports the task as failed.
    async fn fail_task(&self, task_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.get_mut(task_id) {
            if let Some(join) = task.join.take() {
                join.abort();
            }
            task.forced_failed = true;
        }
    }
}

impl TaskQueue for InProcessCluster {
    async fn submit(&self, config: TaskConfig) -> crate::Result<()> {
        let dir = TempDir::new().expect("temp dir");
        let supplier = Supplier::new(SupplierType::InMemory(InMemorySupplier::new(
            self.store.clone(),
        )));
        let driver = DriverClient::new(InMemoryDriver::new(self.max_rows_per_segment));
        let actions = Arc::new(
            InMemoryActionClient::new(self.metadata.clone())
                .with_checkpoint_mailbox(self.checkpoint_tx.clone()),
        );
        let runner = TaskRunner::new(
            config.clone(),
            supplier,
            driver,
            actions,
            Arc::new(JsonRowParser::default()),
            Arc::new(NoopAnnouncer),
            dir.path().to_path_buf(),
        );
        let (handle, join) = runner.spawn();
        self.inner.lock().await.insert(
            config.task_id.clone(),
            ClusterTask {
                config,
                handle,
                join: Some(join),
                report: None,
                forced_failed: false,
                _dir: dir,
            },
        );
        Ok(())
    }

    async fn shutdown(&self, task_id: &str) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.get_mut(task_id) {
            if task.report.is_none() {
                match task.join.take() {
                    Some(join) if join.is_finished() => {
                        task.report = join.await.ok();
                    }
                    Some(join) => {
                        join.abort();
                        task.forced_failed = true;
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    async fn list(&self, datasource: &str) -> crate::Result<Vec<TaskSummary>> {
        self.refresh().await;
        Ok(self
            .inner
            .lock()
            .await
            .iter()
            .filter(|(_, task)| task.config.datasource == datasource)
            .map(|(task_id, task)| TaskSummary {
                task_id: task_id.clone(),
                state: Self::state_of(task),
            })
            .collect())
    }

    async fn config(&self, task_id: &str) -> crate::Result<Option<TaskConfig>> {
        Ok(self.task_config(task_id).await)
    }
}

impl TaskClient for InProcessCluster {
    async fn status(&self, task_id: &str) -> crate::Result<Status> {
        Ok(self.handle_of(task_id).await?.status())
    }

    async fn start_time(&self, task_id: &str) -> crate::Result<Option<chrono::DateTime<Utc>>> {
        Ok(self.handle_of(task_id).await?.start_time())
    }

    async fn checkpoints(
        &self,
        task_id: &str,
    ) -> crate::Result<std::collections::BTreeMap<i32, OffsetMap>> {
        Ok(self.handle_of(task_id).await?.checkpoints())
    }

    async fn current_offsets(&self, task_id: &str) -> crate::Result<OffsetMap> {
        Ok(self.handle_of(task_id).await?.current_offsets())
    }

    async fn pause(&self, task_id: &str) -> crate::Result<OffsetMap> {
        match self.handle_of(task_id).await?.pause().await {
            PauseOutcome::Paused(offsets) => Ok(offsets),
            other => Err(Error::Supervisor(format!(
                "pause not acknowledged: {other:?}"
            ))),
        }
    }

    async fn resume(&self, task_id: &str) -> crate::Result<()> {
        self.handle_of(task_id).await?.resume().await
    }

    async fn set_end_offsets(
        &self,
        task_id: &str,
        offsets: OffsetMap,
        finish: bool,
    ) -> crate::Result<()> {
        match self
            .handle_of(task_id)
            .await?
            .set_end_offsets(offsets, finish)
            .await?
        {
            SetEndOutcome::Ok(_) => Ok(()),
            SetEndOutcome::BadRequest(message) => Err(Error::Supervisor(message)),
        }
    }

    async fn stop(&self, task_id: &str) -> crate::Result<()> {
        self.handle_of(task_id).await?.stop_gracefully();
        Ok(())
    }
}

struct SupHarness {
    cluster: InProcessCluster,
    store: InMemoryStreamStore,
    metadata: InMemoryMetadataStore,
    supervisor: SupervisorHandle,
}

fn sup_config() -> SupervisorConfig {
    let mut config = SupervisorConfig::new(DATASOURCE, STREAM, StreamKind::Kafka);
    config.start_delay = Duration::from_millis(1);
    config.period = Duration::from_millis(50);
    config.chat_retries = 0;
    config.use_earliest_sequence_number = true;
    config.task_duration = Duration::from_secs(3600);
    config.task_tuning = TaskTuningConfig {
        poll_timeout: Duration::from_millis(20),
        ..Default::default()
    };
    config
}

fn start_supervisor(
    config: SupervisorConfig,
    store: InMemoryStreamStore,
    metadata: InMemoryMetadataStore,
    max_rows_per_segment: usize,
) -> SupHarness {
    let (checkpoint_tx, mut checkpoint_rx) = mpsc::channel(16);
    let cluster = InProcessCluster::new(
        store.clone(),
        metadata.clone(),
        checkpoint_tx,
        max_rows_per_segment,
    );
    let supplier = Supplier::new(SupplierType::InMemory(InMemorySupplier::new(store.clone())));
    let actions = Arc::new(InMemoryActionClient::new(metadata.clone()));

    let supervisor = Supervisor::new(
        config,
        supplier,
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        actions,
    )
    .spawn();

    // tasks submit checkpoint actions; the orchestrator routes them back to
    // the owning supervisor
    let forward_to = supervisor.clone();
    tokio::spawn(async move {
        while let Some(notice) = checkpoint_rx.recv().await {
            let _ = forward_to.checkpoint(notice).await;
        }
    });

    SupHarness {
        cluster,
        store,
        metadata,
        supervisor,
    }
}

/// Restart a supervisor against the same cluster, as after a process bounce.
fn restart_supervisor(harness: &SupHarness, config: SupervisorConfig) -> SupervisorHandle {
    let supplier = Supplier::new(SupplierType::InMemory(InMemorySupplier::new(
        harness.store.clone(),
    )));
    let actions = Arc::new(InMemoryActionClient::new(harness.metadata.clone()));
    Supervisor::new(
        config,
        supplier,
        Arc::new(harness.cluster.clone()),
        Arc::new(harness.cluster.clone()),
        actions,
    )
    .spawn()
}

async fn wait_for_running(cluster: &InProcessCluster, count: usize) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let running = cluster.ids_in_state(TaskState::Running).await;
        if running.len() == count {
            return running;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} running tasks, have {running:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_until_async<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition().await
}

fn seeded_store(partition_records: &[(i32, i64)]) -> InMemoryStreamStore {
    let store = InMemoryStreamStore::new();
    store.create_stream(
        STREAM,
        partition_records
            .iter()
            .map(|(p, _)| PartitionId::Int(*p))
            .collect(),
    );
    for (partition, count) in partition_records {
        for i in 0..*count {
            store.append(STREAM, &PartitionId::Int(*partition), payload(i));
        }
    }
    store
}

#[tokio::test]
async fn test_cold_start_spawns_task_from_stream_bounds() {
    let store = seeded_store(&[(0, 0), (1, 0)]);
    let harness = start_supervisor(sup_config(), store, InMemoryMetadataStore::new(), 1000);

    let running = wait_for_running(&harness.cluster, 1).await;
    let config = harness.cluster.task_config(&running[0]).await.unwrap();
    assert_eq!(
        config.io.start_partitions.partitions,
        int_offsets(&[(0, 0), (1, 0)])
    );
    assert!(
        config
            .io
            .end_partitions
            .partitions
            .values()
            .all(|sequence| *sequence == SequenceNumber::NoEnd)
    );

    // the task itself reports the configured open end
    let handle = harness.cluster.handle_of(&running[0]).await.unwrap();
    assert!(
        handle
            .end_offsets()
            .values()
            .all(|sequence| *sequence == SequenceNumber::NoEnd)
    );

    let report = harness.supervisor.status().await.unwrap();
    assert_eq!(report.active_groups.len(), 1);
    assert_eq!(
        report.active_groups[0].offset_source,
        task_group::OffsetSource::EarliestInStream
    );

    harness.supervisor.stop();
}

#[tokio::test]
async fn test_prior_metadata_supplies_start_offsets() {
    let store = seeded_store(&[(0, 3), (1, 5)]);
    let metadata = InMemoryMetadataStore::new();
    metadata.put(DATASOURCE, kafka_meta(&[(0, 3), (1, 5)])).await;

    let harness = start_supervisor(sup_config(), store, metadata, 1000);
    let running = wait_for_running(&harness.cluster, 1).await;

    let config = harness.cluster.task_config(&running[0]).await.unwrap();
    assert_eq!(
        config.io.start_partitions.partitions,
        int_offsets(&[(0, 3), (1, 5)])
    );

    // nothing beyond the stored positions exists, so the task sits exactly
    // at them
    let handle = harness.cluster.handle_of(&running[0]).await.unwrap();
    let handle_for_wait = handle.clone();
    assert!(
        wait_until_async(
            move || {
                let handle = handle_for_wait.clone();
                async move { handle.current_offsets() == int_offsets(&[(0, 3), (1, 5)]) }
            },
            Duration::from_secs(5)
        )
        .await
    );

    let report = harness.supervisor.status().await.unwrap();
    assert_eq!(
        report.active_groups[0].offset_source,
        task_group::OffsetSource::StoredMetadata
    );
    harness.supervisor.stop();
}

#[tokio::test]
async fn test_supervisor_restart_adopts_existing_tasks() {
    let partitions: Vec<(i32, i64)> = (0..16).map(|p| (p, 0)).collect();
    let store = seeded_store(&partitions);
    let mut config = sup_config();
    config.task_count = 2;

    let harness = start_supervisor(config.clone(), store, InMemoryMetadataStore::new(), 1000);
    let mut original = wait_for_running(&harness.cluster, 2).await;
    original.sort();
    let submitted = harness.cluster.submission_count().await;

    // bounce the supervisor; the replacement must adopt, not respawn
    harness.supervisor.stop();
    let replacement = restart_supervisor(&harness, config);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut still_running = harness.cluster.ids_in_state(TaskState::Running).await;
    still_running.sort();
    assert_eq!(still_running, original);
    assert_eq!(harness.cluster.submission_count().await, submitted);

    let report = replacement.status().await.unwrap();
    assert_eq!(report.active_groups.len(), 2);
    assert!(
        report
            .active_groups
            .iter()
            .all(|group| group.offset_source == task_group::OffsetSource::AdoptedTask)
    );
    replacement.stop();
}

#[tokio::test]
async fn test_failed_replica_is_recreated_with_identical_bounds() {
    let store = seeded_store(&[(0, 2)]);
    let mut config = sup_config();
    config.replicas = 2;
    config.late_message_rejection_period = Some(Duration::from_secs(3600));

    let harness = start_supervisor(config, store, InMemoryMetadataStore::new(), 1000);
    let mut original = wait_for_running(&harness.cluster, 2).await;
    original.sort();

    let victim = original[0].clone();
    let survivor = original[1].clone();
    let victim_config = harness.cluster.task_config(&victim).await.unwrap();
    harness.cluster.fail_task(&victim).await;

    // within a tick the supervisor submits an equivalent replacement
    let replaced = wait_for_running(&harness.cluster, 2).await;
    assert!(replaced.contains(&survivor), "survivor was disturbed");
    let new_id = replaced
        .iter()
        .find(|id| **id != survivor)
        .expect("replacement task");
    assert_ne!(*new_id, victim);

    let new_config = harness.cluster.task_config(new_id).await.unwrap();
    assert_eq!(
        new_config.io.base_sequence_name,
        victim_config.io.base_sequence_name
    );
    assert_eq!(
        new_config.io.start_partitions,
        victim_config.io.start_partitions
    );
    assert_eq!(
        new_config.io.minimum_message_time,
        victim_config.io.minimum_message_time
    );
    assert_eq!(
        new_config.io.maximum_message_time,
        victim_config.io.maximum_message_time
    );
    harness.supervisor.stop();
}

#[tokio::test]
async fn test_task_duration_handoff_spawns_successor_from_published_offsets() {
    let store = seeded_store(&[(0, 2)]);
    let mut config = sup_config();
    config.task_duration = Duration::from_millis(300);
    config.completion_timeout = Duration::from_secs(30);

    let harness = start_supervisor(config, store, InMemoryMetadataStore::new(), 1000);
    let first = wait_for_running(&harness.cluster, 1).await[0].clone();

    // duration elapses: the first generation publishes and exits
    {
        let cluster = harness.cluster.clone();
        let first = first.clone();
        assert!(
            wait_until_async(
                move || {
                    let cluster = cluster.clone();
                    let first = first.clone();
                    async move { cluster.ids_in_state(TaskState::Success).await.contains(&first) }
                },
                Duration::from_secs(10)
            )
            .await,
            "first generation never published"
        );
    }
    assert_eq!(
        harness.metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(0, 2)]))
    );

    // and a successor picks up exactly where it ended
    let successors = wait_for_running(&harness.cluster, 1).await;
    assert_ne!(successors[0], first);
    let successor_config = harness.cluster.task_config(&successors[0]).await.unwrap();
    assert_eq!(
        successor_config.io.start_partitions.partitions,
        int_offsets(&[(0, 2)])
    );

    let report = harness.supervisor.status().await.unwrap();
    assert_eq!(
        report.active_groups[0].offset_source,
        task_group::OffsetSource::PriorTaskGroup
    );
    harness.supervisor.stop();
}

#[tokio::test]
async fn test_reset_removes_partition_subset_and_replans() {
    let store = seeded_store(&[(0, 2), (1, 7)]);
    let metadata = InMemoryMetadataStore::new();
    metadata.put(DATASOURCE, kafka_meta(&[(0, 5), (1, 7)])).await;

    let harness = start_supervisor(sup_config(), store, metadata.clone(), 1000);
    let original = wait_for_running(&harness.cluster, 1).await[0].clone();

    let accepted = harness
        .supervisor
        .reset(Some(kafka_meta(&[(0, 0)])))
        .await
        .unwrap();
    assert!(accepted);

    // exactly the named partition is gone from the stored commit
    assert_eq!(
        harness.metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(1, 7)]))
    );

    // the affected group was killed and replanned: partition 0 restarts from
    // the stream bound, partition 1 keeps its stored position
    {
        let cluster = harness.cluster.clone();
        let original = original.clone();
        assert!(
            wait_until_async(
                move || {
                    let cluster = cluster.clone();
                    let original = original.clone();
                    async move { cluster.ids_in_state(TaskState::Failed).await.contains(&original) }
                },
                Duration::from_secs(5)
            )
            .await,
            "reset never killed the running task"
        );
    }
    let replanned = wait_for_running(&harness.cluster, 1).await;
    let config = harness.cluster.task_config(&replanned[0]).await.unwrap();
    assert_eq!(
        config.io.start_partitions.partitions,
        int_offsets(&[(0, 0), (1, 7)])
    );
    harness.supervisor.stop();
}

#[tokio::test]
async fn test_suspension_gracefully_finishes_tasks() {
    let store = seeded_store(&[(0, 3)]);
    let harness = start_supervisor(sup_config(), store, InMemoryMetadataStore::new(), 1000);
    let first = wait_for_running(&harness.cluster, 1).await[0].clone();

    harness.supervisor.suspend().await.unwrap();

    // the running generation is finished at its current offsets and nothing
    // replaces it
    {
        let cluster = harness.cluster.clone();
        let first = first.clone();
        assert!(
            wait_until_async(
                move || {
                    let cluster = cluster.clone();
                    let first = first.clone();
                    async move { cluster.ids_in_state(TaskState::Success).await.contains(&first) }
                },
                Duration::from_secs(10)
            )
            .await,
            "suspension never finished the running task"
        );
    }
    assert_eq!(
        harness.metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(0, 3)]))
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.cluster.ids_in_state(TaskState::Running).await.is_empty());

    let report = harness.supervisor.status().await.unwrap();
    assert!(report.suspended);

    // lifting the suspension replans from the published offsets
    harness.supervisor.resume_supervision().await.unwrap();
    let resumed = wait_for_running(&harness.cluster, 1).await;
    let config = harness.cluster.task_config(&resumed[0]).await.unwrap();
    assert_eq!(config.io.start_partitions.partitions, int_offsets(&[(0, 3)]));
    harness.supervisor.stop();
}

#[tokio::test]
async fn test_checkpoint_request_opens_new_sequence_via_supervisor() {
    let store = seeded_store(&[(0, 0)]);
    // two rows per segment: the third row forces a checkpoint request
    let harness = start_supervisor(sup_config(), store, InMemoryMetadataStore::new(), 2);
    let task = wait_for_running(&harness.cluster, 1).await[0].clone();

    harness.store.append(STREAM, &PartitionId::Int(0), payload(0));
    harness.store.append(STREAM, &PartitionId::Int(0), payload(1));

    // the supervisor answers the checkpoint by opening a sequence at the
    // task's current offsets
    let handle = harness.cluster.handle_of(&task).await.unwrap();
    {
        let handle = handle.clone();
        assert!(
            wait_until_async(
                move || {
                    let handle = handle.clone();
                    async move {
                        handle
                            .checkpoints()
                            .values()
                            .any(|start| *start == int_offsets(&[(0, 2)]))
                    }
                },
                Duration::from_secs(10)
            )
            .await,
            "checkpoint never produced a new sequence"
        );
    }
    // the task went back to reading afterwards
    assert!(
        handle
            .wait_for_status(Status::Reading, Duration::from_secs(5))
            .await
    );
    harness.supervisor.stop();
}
