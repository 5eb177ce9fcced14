use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::sequences::OffsetMap;
use super::*;
use crate::actions::{CheckpointNotice, InMemoryActionClient, InMemoryMetadataStore};
use crate::config::task::{TaskConfig, TaskIoConfig, TaskTuningConfig};
use crate::driver::inmemory::{DriverProbe, InMemoryDriver};
use crate::driver::{CommitMetadata, DriverClient, JsonRowParser};
use crate::metadata::{DataSourceMetadata, StreamKind, StreamPartitions};
use crate::sequence::PartitionId;
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

fn offsets(entries: &[(i32, SequenceNumber)]) -> OffsetMap {
    entries
        .iter()
        .map(|(p, s)| (PartitionId::Int(*p), s.clone()))
        .collect()
}

fn payload(index: i64) -> Bytes {
    Bytes::from(format!(
        "{{\"timestamp\": {}, \"value\": {index}}}",
        1_700_000_000_000_i64 + index
    ))
}

fn task_config(kind: StreamKind, start: OffsetMap, end: OffsetMap) -> TaskConfig {
    TaskConfig {
        task_id: "index_ds_aaa_0".to_string(),
        datasource: DATASOURCE.to_string(),
        kind,
        io: TaskIoConfig {
            task_group_id: 0,
            base_sequence_name: "index_ds_aaa".to_string(),
            start_partitions: StreamPartitions::new(STREAM, start),
            end_partitions: StreamPartitions::new(STREAM, end),
            exclusive_start_partitions: Default::default(),
            use_transaction: true,
            skip_offset_gaps: false,
            minimum_message_time: None,
            maximum_message_time: None,
        },
        tuning: TaskTuningConfig {
            poll_timeout: Duration::from_millis(20),
            max_saved_parse_exceptions: 16,
            ..Default::default()
        },
        context_checkpoints: None,
    }
}

struct Harness {
    store: InMemoryStreamStore,
    metadata: InMemoryMetadataStore,
    actions: Arc<InMemoryActionClient>,
    probe: DriverProbe,
    handle: RunnerHandle,
    join: JoinHandle<TaskReport>,
    persist_dir: std::path::PathBuf,
    _dir: TempDir,
}

struct HarnessBuilder {
    config: TaskConfig,
    store: InMemoryStreamStore,
    metadata: InMemoryMetadataStore,
    max_rows_per_segment: usize,
    checkpoint_tx: Option<mpsc::Sender<CheckpointNotice>>,
    restored: Option<CommitMetadata>,
    hold_handoffs: bool,
}

impl HarnessBuilder {
    fn new(config: TaskConfig, store: InMemoryStreamStore) -> Self {
        Self {
            config,
            store,
            metadata: InMemoryMetadataStore::new(),
            max_rows_per_segment: 1000,
            checkpoint_tx: None,
            restored: None,
            hold_handoffs: false,
        }
    }

    fn metadata(mut self, metadata: InMemoryMetadataStore) -> Self {
        self.metadata = metadata;
        self
    }

    fn max_rows_per_segment(mut self, rows: usize) -> Self {
        self.max_rows_per_segment = rows;
        self
    }

    fn checkpoint_mailbox(mut self, tx: mpsc::Sender<CheckpointNotice>) -> Self {
        self.checkpoint_tx = Some(tx);
        self
    }

    fn restored_commit(mut self, commit: CommitMetadata) -> Self {
        self.restored = Some(commit);
        self
    }

    fn hold_handoffs(mut self) -> Self {
        self.hold_handoffs = true;
        self
    }

    fn spawn(self) -> Harness {
        let dir = TempDir::new().unwrap();
        let persist_dir = dir.path().to_path_buf();

        let supplier = Supplier::new(SupplierType::InMemory(InMemorySupplier::new(
            self.store.clone(),
        )));

        let driver = InMemoryDriver::new(self.max_rows_per_segment);
        let probe = driver.probe();
        if let Some(commit) = self.restored {
            probe.set_restored(commit);
        }
        if self.hold_handoffs {
            probe.hold_handoffs();
        }
        let driver = DriverClient::new(driver);

        let mut actions = InMemoryActionClient::new(self.metadata.clone());
        if let Some(tx) = self.checkpoint_tx {
            actions = actions.with_checkpoint_mailbox(tx);
        }
        let actions = Arc::new(actions);

        let runner = TaskRunner::new(
            self.config,
            supplier,
            driver,
            Arc::clone(&actions),
            Arc::new(JsonRowParser::default()),
            Arc::new(NoopAnnouncer),
            persist_dir.clone(),
        );
        let (handle, join) = runner.spawn();

        Harness {
            store: self.store,
            metadata: self.metadata,
            actions,
            probe,
            handle,
            join,
            persist_dir,
            _dir: dir,
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn wait_processed(handle: &RunnerHandle, processed: u64) {
    let handle = handle.clone();
    assert!(
        wait_until(
            move || handle.row_stats().processed >= processed,
            Duration::from_secs(5)
        )
        .await,
        "timed out waiting for {processed} processed rows"
    );
}

fn kafka_meta(entries: &[(i32, SequenceNumber)]) -> DataSourceMetadata {
    DataSourceMetadata::new(
        StreamKind::Kafka,
        StreamPartitions::new(STREAM, offsets(entries)),
    )
}

fn seeded_store(partition_records: &[(i32, i64)]) -> InMemoryStreamStore {
    let store = InMemoryStreamStore::new();
    store.create_stream(
        STREAM,
        partition_records.iter().map(|(p, _)| PartitionId::Int(*p)).collect(),
    );
    for (partition, count) in partition_records {
        for i in 0..*count {
            store.append(STREAM, &PartitionId::Int(*partition), payload(i));
        }
    }
    store
}

#[tokio::test]
async fn test_reads_to_end_offsets_and_publishes() {
    let store = seeded_store(&[(0, 5)]);
    let config = task_config(StreamKind::Kafka, int_offsets(&[(0, 0)]), int_offsets(&[(0, 5)]));
    let harness = HarnessBuilder::new(config, store).spawn();

    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);
    assert_eq!(report.ingestion_state, IngestionState::Completed);
    assert_eq!(report.row_stats.processed, 5);
    assert!(report.error_msg.is_none());

    // the offset commit advanced together with the segments
    assert_eq!(
        harness.metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(0, SequenceNumber::Int(5))]))
    );
    assert!(!harness.probe.published_segments().is_empty());
    assert!(harness.probe.is_closed());

    // published sequences leave the persisted list empty
    let persisted = sequences::restore(&harness.persist_dir).await.unwrap();
    assert_eq!(persisted, Some(vec![]));
}

#[tokio::test]
async fn test_unbounded_task_reports_configured_end_offsets() {
    let store = seeded_store(&[(0, 3)]);
    let config = task_config(
        StreamKind::Kafka,
        int_offsets(&[(0, 0)]),
        offsets(&[(0, SequenceNumber::NoEnd)]),
    );
    let harness = HarnessBuilder::new(config, store).spawn();

    wait_processed(&harness.handle, 3).await;
    assert_eq!(
        harness.handle.end_offsets(),
        offsets(&[(0, SequenceNumber::NoEnd)])
    );

    // supervisor-style finish: pause, capture offsets, set them as the end
    let PauseOutcome::Paused(paused_offsets) = harness.handle.pause().await else {
        panic!("pause was not acknowledged");
    };
    assert_eq!(paused_offsets, int_offsets(&[(0, 3)]));

    let outcome = harness
        .handle
        .set_end_offsets(paused_offsets.clone(), true)
        .await
        .unwrap();
    assert_eq!(outcome, SetEndOutcome::Ok(paused_offsets));

    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);
    assert_eq!(
        harness.metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(0, SequenceNumber::Int(3))]))
    );
}

#[tokio::test]
async fn test_adopts_current_offsets_from_driver_commit() {
    let store = seeded_store(&[(0, 5)]);
    let config = task_config(
        StreamKind::Kafka,
        int_offsets(&[(0, 3)]),
        offsets(&[(0, SequenceNumber::NoEnd)]),
    );
    let harness = HarnessBuilder::new(config, store)
        .restored_commit(CommitMetadata {
            next_partitions: StreamPartitions::new(STREAM, int_offsets(&[(0, 3)])),
        })
        .spawn();

    // only the records past the restored position are read
    wait_processed(&harness.handle, 2).await;
    {
        let handle = harness.handle.clone();
        assert!(
            wait_until(
                move || handle.current_offsets() == int_offsets(&[(0, 5)]),
                Duration::from_secs(5)
            )
            .await
        );
    }
    assert_eq!(harness.handle.row_stats().processed, 2);

    harness.handle.stop_gracefully();
    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);
}

#[tokio::test]
async fn test_pause_parks_the_loop_at_exact_offsets() {
    let store = seeded_store(&[(0, 3)]);
    let config = task_config(
        StreamKind::Kafka,
        int_offsets(&[(0, 0)]),
        offsets(&[(0, SequenceNumber::NoEnd)]),
    );
    let harness = HarnessBuilder::new(config, store).spawn();

    wait_processed(&harness.handle, 3).await;
    let PauseOutcome::Paused(paused_offsets) = harness.handle.pause().await else {
        panic!("pause was not acknowledged");
    };
    assert_eq!(paused_offsets, int_offsets(&[(0, 3)]));
    assert_eq!(harness.handle.status(), Status::Paused);

    // records arriving while paused are not ingested
    harness.store.append(STREAM, &PartitionId::Int(0), payload(3));
    harness.store.append(STREAM, &PartitionId::Int(0), payload(4));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(harness.handle.current_offsets(), paused_offsets);
    assert_eq!(harness.handle.row_stats().processed, 3);

    harness.handle.resume().await.unwrap();
    wait_processed(&harness.handle, 5).await;
    assert_eq!(harness.handle.current_offsets(), int_offsets(&[(0, 5)]));

    harness.handle.stop_gracefully();
    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);
    // stopped before anything was published
    assert!(harness.actions.published().await.is_empty());
}

#[tokio::test]
async fn test_set_end_offsets_validation() {
    let store = seeded_store(&[(0, 3)]);
    let config = task_config(
        StreamKind::Kafka,
        int_offsets(&[(0, 0)]),
        offsets(&[(0, SequenceNumber::NoEnd)]),
    );
    let harness = HarnessBuilder::new(config, store).spawn();
    wait_processed(&harness.handle, 3).await;

    // not paused
    let outcome = harness
        .handle
        .set_end_offsets(int_offsets(&[(0, 10)]), true)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        SetEndOutcome::BadRequest(ref msg) if msg.contains("paused")
    ));

    assert!(matches!(
        harness.handle.pause().await,
        PauseOutcome::Paused(_)
    ));

    // unknown partition
    let outcome = harness
        .handle
        .set_end_offsets(int_offsets(&[(7, 10)]), true)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        SetEndOutcome::BadRequest(ref msg) if msg.contains("partitions")
    ));

    // regression below the current offset
    let outcome = harness
        .handle
        .set_end_offsets(int_offsets(&[(0, 1)]), true)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        SetEndOutcome::BadRequest(ref msg) if msg.contains("must be >= current offset")
    ));

    harness.handle.resume().await.unwrap();
    harness.handle.stop_gracefully();
    harness.join.await.unwrap();
}

#[tokio::test]
async fn test_end_of_shard_retires_partitions_and_finishes() {
    let store = seeded_store(&[(0, 3), (1, 2)]);
    store.close_partition(STREAM, &PartitionId::Int(0));
    let config = task_config(
        StreamKind::Kinesis,
        int_offsets(&[(0, 0), (1, 0)]),
        offsets(&[
            (0, SequenceNumber::NoEnd),
            (1, SequenceNumber::NoEnd),
        ]),
    );
    let harness = HarnessBuilder::new(config, store).spawn();

    wait_processed(&harness.handle, 5).await;
    {
        let handle = harness.handle.clone();
        assert!(
            wait_until(
                move || {
                    handle.current_offsets().get(&PartitionId::Int(0))
                        == Some(&SequenceNumber::EndOfShard)
                },
                Duration::from_secs(5)
            )
            .await,
            "closed shard never surfaced as END_OF_SHARD"
        );
    }
    // the open partition keeps advancing while the closed one is parked
    assert_eq!(
        harness.handle.current_offsets().get(&PartitionId::Int(1)),
        Some(&SequenceNumber::Int(2))
    );

    // once the second partition also closes the task publishes and exits
    harness.store.close_partition(STREAM, &PartitionId::Int(1));
    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);

    let stored = harness.metadata.get(DATASOURCE).await.unwrap();
    assert_eq!(
        stored.partitions.partitions.get(&PartitionId::Int(0)),
        Some(&SequenceNumber::EndOfShard)
    );
}

#[tokio::test]
async fn test_checkpoints_chain_sequences_and_publish_monotonically() {
    let store = seeded_store(&[(0, 0)]);
    let config = task_config(
        StreamKind::Kafka,
        int_offsets(&[(0, 0)]),
        offsets(&[(0, SequenceNumber::NoEnd)]),
    );

    let (checkpoint_tx, mut checkpoint_rx) = mpsc::channel::<CheckpointNotice>(4);
    let harness = HarnessBuilder::new(config, store)
        .max_rows_per_segment(2)
        .checkpoint_mailbox(checkpoint_tx)
        .spawn();

    // play the supervisor: answer each checkpoint request by opening a new
    // sequence at the task's current offsets
    let supervisor_handle = harness.handle.clone();
    let supervisor = tokio::spawn(async move {
        while let Some(notice) = checkpoint_rx.recv().await {
            assert_eq!(notice.datasource, DATASOURCE);
            supervisor_handle
                .wait_for_status(Status::Paused, Duration::from_secs(5))
                .await;
            let current = notice.current_metadata.partitions.partitions.clone();
            let outcome = supervisor_handle
                .set_end_offsets(current, false)
                .await
                .unwrap();
            assert!(matches!(outcome, SetEndOutcome::Ok(_)));
        }
    });

    // two records fill a segment and trigger the first checkpoint
    harness.store.append(STREAM, &PartitionId::Int(0), payload(0));
    harness.store.append(STREAM, &PartitionId::Int(0), payload(1));
    {
        let handle = harness.handle.clone();
        assert!(
            wait_until(
                move || handle.checkpoints().values().any(|start| start == &int_offsets(&[(0, 2)])),
                Duration::from_secs(5)
            )
            .await,
            "first checkpoint never opened a second sequence"
        );
    }

    harness.store.append(STREAM, &PartitionId::Int(0), payload(2));
    harness.store.append(STREAM, &PartitionId::Int(0), payload(3));
    {
        let handle = harness.handle.clone();
        assert!(
            wait_until(
                // earlier sequences publish as they drain, so count starts
                move || handle.checkpoints().values().any(|start| start == &int_offsets(&[(0, 4)])),
                Duration::from_secs(5)
            )
            .await,
            "second checkpoint never opened a third sequence"
        );
    }
    wait_processed(&harness.handle, 4).await;

    // the chain persisted on disk stays linked
    let persisted = sequences::restore(&harness.persist_dir)
        .await
        .unwrap()
        .unwrap();
    for window in persisted.windows(2) {
        assert_eq!(window[0].end_offsets, window[1].start_offsets);
        assert!(window[0].checkpointed);
    }

    // finish the task at offset 4
    harness.store.append(STREAM, &PartitionId::Int(0), payload(4));
    wait_processed(&harness.handle, 5).await;
    let PauseOutcome::Paused(paused) = harness.handle.pause().await else {
        panic!("pause was not acknowledged");
    };
    harness
        .handle
        .set_end_offsets(paused, true)
        .await
        .unwrap();

    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);
    supervisor.abort();

    // every publish advanced the commit monotonically
    let published = harness.actions.published().await;
    assert!(published.len() >= 2);
    for insert in &published {
        let start = insert.start_metadata.as_ref().unwrap();
        let end = insert.end_metadata.as_ref().unwrap();
        for (partition, start_seq) in &start.partitions.partitions {
            let end_seq = end.partitions.partitions.get(partition).unwrap();
            assert!(end_seq >= start_seq);
        }
    }
    assert_eq!(
        harness.metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(0, SequenceNumber::Int(5))]))
    );
}

#[tokio::test]
async fn test_replaying_a_published_range_is_rejected() {
    let store = seeded_store(&[(0, 3)]);
    let metadata = InMemoryMetadataStore::new();

    let config = task_config(StreamKind::Kafka, int_offsets(&[(0, 0)]), int_offsets(&[(0, 3)]));
    let first = HarnessBuilder::new(config.clone(), store.clone())
        .metadata(metadata.clone())
        .spawn();
    let report = first.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);
    assert_eq!(
        metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(0, SequenceNumber::Int(3))]))
    );

    // same task again: the compare-and-swap on stored metadata fails and
    // nothing is double-published
    let replay = HarnessBuilder::new(config, store)
        .metadata(metadata.clone())
        .spawn();
    let report = replay.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Failure);
    assert!(report.error_msg.unwrap().contains("Transaction failure"));

    assert_eq!(
        metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(0, SequenceNumber::Int(3))]))
    );
    assert_eq!(replay.actions.published().await.len(), 0);
}

#[tokio::test]
async fn test_unavailable_start_offset_fails_without_reset() {
    let store = seeded_store(&[(0, 5)]);
    store.trim(STREAM, &PartitionId::Int(0), 3);

    let config = task_config(
        StreamKind::Kafka,
        int_offsets(&[(0, 0)]),
        offsets(&[(0, SequenceNumber::NoEnd)]),
    );
    let harness = HarnessBuilder::new(config, store).spawn();

    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Failure);
    assert!(report.error_msg.unwrap().contains("no longer available"));
}

#[tokio::test]
async fn test_unavailable_start_offset_resets_automatically() {
    let store = seeded_store(&[(0, 5)]);
    store.trim(STREAM, &PartitionId::Int(0), 3);
    let metadata = InMemoryMetadataStore::new();

    let mut config = task_config(
        StreamKind::Kafka,
        int_offsets(&[(0, 0)]),
        offsets(&[(0, SequenceNumber::NoEnd)]),
    );
    config.tuning.reset_offset_automatically = true;

    metadata
        .put(DATASOURCE, kafka_meta(&[(0, SequenceNumber::Int(0))]))
        .await;
    let harness = HarnessBuilder::new(config, store)
        .metadata(metadata.clone())
        .spawn();

    // the task asks for a reset and parks until the supervisor replaces it
    assert!(
        harness
            .handle
            .wait_for_status(Status::Paused, Duration::from_secs(5))
            .await
    );
    let stored = metadata.get(DATASOURCE).await.unwrap();
    assert!(stored.partitions.partitions.is_empty());

    harness.handle.stop_gracefully();
    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);
}

#[tokio::test]
async fn test_max_parse_exceptions_is_fatal() {
    let store = InMemoryStreamStore::new();
    store.create_stream(STREAM, vec![PartitionId::Int(0)]);
    for _ in 0..3 {
        store.append(STREAM, &PartitionId::Int(0), Bytes::from("not json"));
    }

    let mut config = task_config(
        StreamKind::Kafka,
        int_offsets(&[(0, 0)]),
        offsets(&[(0, SequenceNumber::NoEnd)]),
    );
    config.tuning.max_parse_exceptions = 1;

    let harness = HarnessBuilder::new(config, store).spawn();
    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Failure);
    assert_eq!(report.row_stats.unparseable, 2);
    assert!(!report.unparseable_events.is_empty());
    assert!(report.error_msg.unwrap().contains("Max parse exceptions"));
}

#[tokio::test]
async fn test_handoff_timeout_is_not_a_failure() {
    let store = seeded_store(&[(0, 2)]);
    let mut config = task_config(StreamKind::Kafka, int_offsets(&[(0, 0)]), int_offsets(&[(0, 2)]));
    config.tuning.handoff_condition_timeout = Duration::from_millis(100);

    let harness = HarnessBuilder::new(config, store).hold_handoffs().spawn();

    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);
    assert_eq!(
        harness.metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(0, SequenceNumber::Int(2))]))
    );
}

#[tokio::test]
async fn test_restores_sequences_from_context_checkpoints() {
    let store = seeded_store(&[(0, 4)]);
    let mut config = task_config(
        StreamKind::Kafka,
        int_offsets(&[(0, 0)]),
        int_offsets(&[(0, 4)]),
    );
    config.context_checkpoints = Some(BTreeMap::from([
        (0, StreamPartitions::new(STREAM, int_offsets(&[(0, 0)]))),
        (1, StreamPartitions::new(STREAM, int_offsets(&[(0, 2)]))),
    ]));

    let harness = HarnessBuilder::new(config, store).spawn();
    let report = harness.join.await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Success);

    // both restored sequences published, chaining through offset 2
    let published = harness.actions.published().await;
    assert_eq!(published.len(), 2);
    assert_eq!(
        published[0].end_metadata.as_ref().unwrap().partitions.partitions,
        int_offsets(&[(0, 2)])
    );
    assert_eq!(
        harness.metadata.get(DATASOURCE).await,
        Some(kafka_meta(&[(0, SequenceNumber::Int(4))]))
    );
}
