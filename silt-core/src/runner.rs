//! Per-task ingestion state machine. One runner owns a slice of partitions,
//! pulls records through the supplier, routes parsed rows into the segment
//! driver under checkpointed sequences, and finishes with a transactional
//! publish that advances the stored offset commit.
//!
//! States move `NOT_STARTED → STARTING → READING ⇄ PAUSED → PUBLISHING`.
//! The reading loop runs in a single spawned task; HTTP-facing calls
//! coordinate with it exclusively through the pause lock and two watch
//! channels (`status`, `pause_requested`). The loop yields control at
//! exactly three points: after each poll, at the pause check, and on entry
//! to publishing. If `pause` returns the paused offsets, the loop is parked
//! and nothing is ingested until `resume`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::{CheckpointNotice, MetadataActionClient, SegmentTransactionalInsert};
use crate::config::task::TaskConfig;
use crate::driver::{CommitMetadata, DriverClient, ParseError, RowParser};
use crate::message::{StreamPartition, StreamRecord};
use crate::metadata::{DataSourceMetadata, StreamPartitions};
use crate::meters::{RowMeters, RowStats, SavedParseFailures};
use crate::sequence::SequenceNumber;
use crate::supplier::Supplier;
use crate::{Error, Result};

pub mod http;
pub mod sequences;

use sequences::{OffsetMap, SequenceMetadata};

const PAUSE_ACK_TIMEOUT: Duration = Duration::from_secs(2);
const RESUME_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    NotStarted,
    Starting,
    Reading,
    Paused,
    Publishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IngestionState {
    NotStarted,
    BuildSegments,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Success,
    Failure,
}

/// Written next to the task's persist directory when the run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: String,
    pub outcome: TaskOutcome,
    pub ingestion_state: IngestionState,
    pub row_stats: RowStats,
    pub unparseable_events: Vec<String>,
    pub error_msg: Option<String>,
}

/// Presence registration with service discovery; the orchestrator supplies
/// the real one.
pub trait TaskAnnouncer: Send + Sync {
    fn announce(&self, task_id: &str);
    fn unannounce(&self, task_id: &str);
}

#[derive(Debug, Default)]
pub struct NoopAnnouncer;

impl TaskAnnouncer for NoopAnnouncer {
    fn announce(&self, _task_id: &str) {}
    fn unannounce(&self, _task_id: &str) {}
}

/// Outcome of a pause request, mapped onto HTTP codes by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseOutcome {
    /// The loop parked; these are the exact next-to-read positions.
    Paused(OffsetMap),
    /// Accepted but the loop had not parked within the ack window.
    Accepted,
    /// Not in a pausable state.
    NotPausable(Status),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetEndOutcome {
    Ok(OffsetMap),
    BadRequest(String),
}

enum RunOutcome {
    Completed,
    /// Stop was requested before anything needed publishing; not a failure.
    StoppedBeforePublishing,
}

struct RunnerShared {
    config: TaskConfig,
    persist_dir: PathBuf,
    status_tx: watch::Sender<Status>,
    pause_requested_tx: watch::Sender<bool>,
    /// Serializes compound mutations (sequences, end offsets, pause flag)
    /// between HTTP calls and the run loop.
    pause_lock: tokio::sync::Mutex<()>,
    curr_offsets: Mutex<OffsetMap>,
    end_offsets: Mutex<OffsetMap>,
    sequences: Mutex<Vec<SequenceMetadata>>,
    /// Expected first sequence number per partition, consumed as records
    /// arrive; extended when a checkpoint opens a new sequence.
    initial_offsets_snapshot: Mutex<OffsetMap>,
    next_checkpoint_time: Mutex<Instant>,
    stop_requested: AtomicBool,
    publish_on_stop: AtomicBool,
    background_error: Mutex<Option<Error>>,
    meters: RowMeters,
    saved_parse_failures: SavedParseFailures,
    start_time: Mutex<Option<DateTime<Utc>>>,
    /// Interrupts a publish in flight when stopping from PUBLISHING.
    cancel: CancellationToken,
}

impl RunnerShared {
    fn status(&self) -> Status {
        *self.status_tx.borrow()
    }

    fn curr(&self) -> OffsetMap {
        self.curr_offsets.lock().expect("offsets lock").clone()
    }

    fn end(&self) -> OffsetMap {
        self.end_offsets.lock().expect("offsets lock").clone()
    }

    fn take_background_error(&self) -> Option<Error> {
        self.background_error.lock().expect("error lock").take()
    }

    fn set_background_error(&self, error: Error) {
        self.background_error
            .lock()
            .expect("error lock")
            .get_or_insert(error);
    }

    fn reset_next_checkpoint_time(&self) {
        *self.next_checkpoint_time.lock().expect("checkpoint lock") =
            Instant::now() + self.config.tuning.intermediate_handoff_period;
    }

    fn request_pause(&self) {
        self.pause_requested_tx.send_replace(true);
    }
}

/// Clonable view of the runner used by the HTTP surface and the supervisor's
/// in-process chat client.
#[derive(Clone)]
pub struct RunnerHandle {
    shared: Arc<RunnerShared>,
}

impl RunnerHandle {
    pub fn task_id(&self) -> String {
        self.shared.config.task_id.clone()
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn current_offsets(&self) -> OffsetMap {
        self.shared.curr()
    }

    pub fn end_offsets(&self) -> OffsetMap {
        self.shared.end()
    }

    /// Ordered `{sequence id → start offsets}` of the live sequences.
    pub fn checkpoints(&self) -> std::collections::BTreeMap<i32, OffsetMap> {
        self.shared
            .sequences
            .lock()
            .expect("sequences lock")
            .iter()
            .map(|s| (s.sequence_id, s.start_offsets.clone()))
            .collect()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.shared.start_time.lock().expect("start time lock")
    }

    pub fn row_stats(&self) -> RowStats {
        self.shared.meters.totals()
    }

    pub fn unparseable_events(&self) -> Vec<String> {
        self.shared.saved_parse_failures.messages()
    }

    pub async fn wait_for_status(&self, wanted: Status, timeout: Duration) -> bool {
        let mut rx = self.shared.status_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|status| *status == wanted))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Signals the loop to park and waits briefly for the acknowledgement.
    pub async fn pause(&self) -> PauseOutcome {
        let status = self.shared.status();
        if status != Status::Reading && status != Status::Paused {
            return PauseOutcome::NotPausable(status);
        }

        {
            let _guard = self.shared.pause_lock.lock().await;
            self.shared.request_pause();
        }

        let mut rx = self.shared.status_tx.subscribe();
        let result = match tokio::time::timeout(
            PAUSE_ACK_TIMEOUT,
            rx.wait_for(|status| *status == Status::Paused),
        )
        .await
        {
            Ok(Ok(_)) => PauseOutcome::Paused(self.shared.curr()),
            _ => PauseOutcome::Accepted,
        };
        result
    }

    pub async fn resume(&self) -> Result<()> {
        {
            let _guard = self.shared.pause_lock.lock().await;
            self.shared.pause_requested_tx.send_replace(false);
        }

        let mut rx = self.shared.status_tx.subscribe();
        tokio::time::timeout(
            RESUME_ACK_TIMEOUT,
            rx.wait_for(|status| *status != Status::Paused),
        )
        .await
        .map_err(|_| Error::Runner("Resume command was not accepted within 5 seconds".to_string()))?
        .map_err(|e| Error::Runner(format!("Run loop has gone away: {e}")))?;
        Ok(())
    }

    /// Finalizes (or extends) the sequence chain while the loop is paused.
    /// With `finish` the task's end offsets become `offsets` and the latest
    /// sequence is closed; without it a new open sequence starts at
    /// `offsets`.
    pub async fn set_end_offsets(
        &self,
        offsets: OffsetMap,
        finish: bool,
    ) -> Result<SetEndOutcome> {
        if offsets.is_empty() {
            return Ok(SetEndOutcome::BadRequest(
                "Request body must contain a map of {partition: endOffset}".to_string(),
            ));
        }
        {
            let end = self.shared.end_offsets.lock().expect("offsets lock");
            if !offsets.keys().all(|partition| end.contains_key(partition)) {
                return Ok(SetEndOutcome::BadRequest(format!(
                    "Request contains partitions not being handled by this task, my partitions: {:?}",
                    end.keys().collect::<Vec<_>>()
                )));
            }
        }

        let guard = self.shared.pause_lock.lock().await;

        let validated: std::result::Result<Vec<SequenceMetadata>, SetEndOutcome> = {
            let mut sequences = self.shared.sequences.lock().expect("sequences lock");
            let Some(latest) = sequences.last_mut() else {
                return Err(Error::Runner(
                    "No sequences found to set end offsets".to_string(),
                ));
            };

            if (latest.start_offsets == offsets && !finish)
                || (latest.end_offsets == offsets && finish)
            {
                warn!("Ignoring duplicate request, end offsets already set");
                return Ok(SetEndOutcome::Ok(offsets));
            }

            if latest.checkpointed {
                Err(SetEndOutcome::BadRequest(format!(
                    "Sequence [{}] already has its end offsets set, cannot change them",
                    latest.sequence_name
                )))
            } else if self.shared.status() != Status::Paused {
                Err(SetEndOutcome::BadRequest(
                    "Task must be paused before changing the end offsets".to_string(),
                ))
            } else {
                let curr = self.shared.curr_offsets.lock().expect("offsets lock");
                let regression = offsets.iter().find(|(partition, sequence)| {
                    matches!(curr.get(*partition), Some(current) if *sequence < current)
                });
                match regression {
                    Some((partition, _)) => Err(SetEndOutcome::BadRequest(format!(
                        "End offset must be >= current offset for partition [{partition}] (current: {})",
                        curr.get(partition).map(|s| s.to_string()).unwrap_or_default()
                    ))),
                    None => {
                        drop(curr);
                        self.shared.reset_next_checkpoint_time();
                        latest.set_end_offsets(&offsets);

                        if finish {
                            let mut end =
                                self.shared.end_offsets.lock().expect("offsets lock");
                            info!(?offsets, "Updating task end offsets");
                            for (partition, sequence) in &offsets {
                                end.insert(partition.clone(), sequence.clone());
                            }
                        } else {
                            let next_id = latest.sequence_id + 1;
                            let new_sequence = SequenceMetadata::new(
                                next_id,
                                self.shared.config.io.sequence_name(next_id),
                                offsets.clone(),
                                self.shared.end_offsets.lock().expect("offsets lock").clone(),
                                false,
                            );
                            info!(sequence = %new_sequence.sequence_name, "Opening new sequence");
                            sequences.push(new_sequence);
                            self.shared
                                .initial_offsets_snapshot
                                .lock()
                                .expect("offsets lock")
                                .extend(offsets.clone());
                        }
                        Ok(sequences.clone())
                    }
                }
            }
        };

        let snapshot = match validated {
            Ok(snapshot) => snapshot,
            Err(bad_request) => return Ok(bad_request),
        };

        if let Err(e) = sequences::persist(&self.shared.persist_dir, &snapshot).await {
            error!(?e, "Unable to persist sequences after setting end offsets, dying");
            self.shared.set_background_error(e.clone());
            drop(guard);
            // resume so the loop can observe the failure and terminate
            let _ = self.resume().await;
            return Err(e);
        }

        drop(guard);
        self.resume().await?;
        Ok(SetEndOutcome::Ok(offsets))
    }

    /// Cooperative stop: clears any pause so the loop can observe the flag;
    /// a loop already publishing is interrupted instead.
    pub fn stop_gracefully(&self) {
        info!(status = ?self.shared.status(), "Stopping gracefully");
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        if self.shared.status() == Status::Publishing {
            self.shared.cancel.cancel();
            return;
        }
        self.shared.pause_requested_tx.send_replace(false);
    }
}

pub struct TaskRunner<M: MetadataActionClient> {
    shared: Arc<RunnerShared>,
    supplier: Supplier,
    driver: DriverClient,
    actions: Arc<M>,
    parser: Arc<dyn RowParser>,
    announcer: Arc<dyn TaskAnnouncer>,
    publish_wait_list: Vec<JoinHandle<Result<oneshot::Receiver<()>>>>,
    handoff_wait_list: Vec<oneshot::Receiver<()>>,
    publishing_sequences: HashSet<String>,
    ingestion_state: IngestionState,
}

impl<M: MetadataActionClient> TaskRunner<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TaskConfig,
        supplier: Supplier,
        driver: DriverClient,
        actions: Arc<M>,
        parser: Arc<dyn RowParser>,
        announcer: Arc<dyn TaskAnnouncer>,
        persist_dir: PathBuf,
    ) -> Self {
        let end_offsets = config.io.end_partitions.partitions.clone();
        let intermediate_handoff_period = config.tuning.intermediate_handoff_period;
        let max_saved_parse_exceptions = config.tuning.max_saved_parse_exceptions;
        let shared = Arc::new(RunnerShared {
            config,
            persist_dir,
            status_tx: watch::Sender::new(Status::NotStarted),
            pause_requested_tx: watch::Sender::new(false),
            pause_lock: tokio::sync::Mutex::new(()),
            curr_offsets: Mutex::new(OffsetMap::new()),
            end_offsets: Mutex::new(end_offsets),
            sequences: Mutex::new(Vec::new()),
            initial_offsets_snapshot: Mutex::new(OffsetMap::new()),
            next_checkpoint_time: Mutex::new(Instant::now() + intermediate_handoff_period),
            stop_requested: AtomicBool::new(false),
            publish_on_stop: AtomicBool::new(false),
            background_error: Mutex::new(None),
            meters: RowMeters::default(),
            saved_parse_failures: SavedParseFailures::new(max_saved_parse_exceptions),
            start_time: Mutex::new(None),
            cancel: CancellationToken::new(),
        });
        Self {
            shared,
            supplier,
            driver,
            actions,
            parser,
            announcer,
            publish_wait_list: Vec::new(),
            handoff_wait_list: Vec::new(),
            publishing_sequences: HashSet::new(),
            ingestion_state: IngestionState::NotStarted,
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn config(&self) -> &TaskConfig {
        &self.shared.config
    }

    fn stream(&self) -> String {
        self.shared.config.io.stream().to_string()
    }

    fn commit_metadata(&self) -> CommitMetadata {
        CommitMetadata {
            next_partitions: StreamPartitions::new(self.stream(), self.shared.curr()),
        }
    }

    fn metadata_for(&self, offsets: OffsetMap) -> DataSourceMetadata {
        DataSourceMetadata::new(
            self.config().kind,
            StreamPartitions::new(self.stream(), offsets),
        )
    }

    /// Runs the task to completion and writes the completion report.
    pub async fn run(mut self) -> TaskReport {
        let task_id = self.config().task_id.clone();
        info!(task_id, "Seekable stream indexing task starting up");
        *self.shared.start_time.lock().expect("start time lock") = Some(Utc::now());
        self.shared.status_tx.send_replace(Status::Starting);
        self.announcer.announce(&task_id);

        let outcome = self.run_internal().await;

        // shutdown frame: every step runs, the first error stays primary
        let mut shutdown_errors: Vec<Error> = Vec::new();
        for handle in self.publish_wait_list.drain(..) {
            handle.abort();
        }
        self.handoff_wait_list.clear();
        if let Err(e) = self.driver.close().await {
            shutdown_errors.push(e);
        }
        if let Err(e) = self.supplier.close().await {
            shutdown_errors.push(e);
        }
        self.announcer.unannounce(&task_id);
        for e in &shutdown_errors {
            error!(?e, "Error during task shutdown");
        }

        let (outcome, error_msg) = match outcome {
            Ok(RunOutcome::Completed) => (TaskOutcome::Success, None),
            Ok(RunOutcome::StoppedBeforePublishing) | Err(Error::StoppedWithoutPublishing) => {
                info!("The task was asked to stop before completing");
                (TaskOutcome::Success, None)
            }
            Err(e) => {
                error!(?e, "Encountered exception while running task");
                (TaskOutcome::Failure, Some(e.to_string()))
            }
        };

        let report = TaskReport {
            task_id,
            outcome,
            ingestion_state: self.ingestion_state,
            row_stats: self.shared.meters.totals(),
            unparseable_events: self.shared.saved_parse_failures.messages(),
            error_msg,
        };
        if let Err(e) = self.write_report(&report).await {
            warn!(?e, "Unable to write task completion report");
        }
        report
    }

    async fn write_report(&self, report: &TaskReport) -> Result<()> {
        let payload = serde_json::to_vec_pretty(report)
            .map_err(|e| Error::Persist(format!("failed to encode report: {e}")))?;
        tokio::fs::create_dir_all(&self.shared.persist_dir)
            .await
            .map_err(|e| Error::Persist(format!("failed to create persist dir: {e}")))?;
        tokio::fs::write(self.shared.persist_dir.join("report.json"), payload)
            .await
            .map_err(|e| Error::Persist(format!("failed to write report: {e}")))
    }

    async fn run_internal(&mut self) -> Result<RunOutcome> {
        self.restore_or_create_sequences().await?;
        info!(
            sequences = ?self.shared.sequences.lock().expect("sequences lock"),
            "Starting with sequences"
        );

        self.adopt_driver_metadata().await?;

        // Partitions already at end-of-shard have been fully read; the
        // supervisor should have excluded them, so this is defensive.
        {
            let mut curr = self.shared.curr_offsets.lock().expect("offsets lock");
            let before = curr.len();
            curr.retain(|_, sequence| *sequence != SequenceNumber::EndOfShard);
            if curr.len() < before {
                info!(
                    removed = before - curr.len(),
                    "Removed partitions already closed from assignment"
                );
            }
        }

        // restart publishing of restored sequences, if any
        self.maybe_persist_and_publish().await?;

        let mut assignment = self.assign_partitions().await?;
        self.check_sequence_availability(&assignment).await?;
        self.seek_to_current(&assignment).await?;

        self.ingestion_state = IngestionState::BuildSegments;
        {
            let curr = self.shared.curr();
            self.shared
                .initial_offsets_snapshot
                .lock()
                .expect("offsets lock")
                .extend(curr);
        }

        let mut still_reading = !assignment.is_empty();
        self.shared.status_tx.send_replace(Status::Reading);

        let read_result = self.read_loop(&mut assignment, &mut still_reading).await;

        // always persist pending data; a read error stays primary
        let persist_result = self.driver.persist(self.commit_metadata()).await;
        match (&read_result, persist_result) {
            (Err(_), Err(persist_error)) => {
                error!(?persist_error, "Also failed to persist while shutting down");
            }
            (Ok(_), Err(persist_error)) => return Err(persist_error),
            _ => {}
        }
        read_result?;
        self.ingestion_state = IngestionState::Completed;

        {
            let _guard = self.shared.pause_lock.lock().await;
            if self.shared.stop_requested.load(Ordering::SeqCst)
                && !self.shared.publish_on_stop.load(Ordering::SeqCst)
            {
                return Ok(RunOutcome::StoppedBeforePublishing);
            }
            self.shared.status_tx.send_replace(Status::Publishing);
        }

        self.publish_remaining_sequences().await?;
        self.await_publishes().await?;
        self.await_handoffs().await?;

        Ok(RunOutcome::Completed)
    }

    async fn restore_or_create_sequences(&mut self) -> Result<()> {
        if let Some(restored) = sequences::restore(&self.shared.persist_dir).await? {
            *self.shared.sequences.lock().expect("sequences lock") = restored;
            return Ok(());
        }

        let io = &self.config().io;
        let sequences = match &self.config().context_checkpoints {
            Some(checkpoints) if !checkpoints.is_empty() => {
                let checkpoints = checkpoints
                    .iter()
                    .map(|(id, partitions)| (*id, partitions.partitions.clone()))
                    .collect();
                sequences::from_checkpoints(&io.base_sequence_name, &checkpoints, &self.shared.end())
            }
            _ => vec![SequenceMetadata::new(
                0,
                io.sequence_name(0),
                io.start_partitions.partitions.clone(),
                self.shared.end(),
                false,
            )],
        };
        *self.shared.sequences.lock().expect("sequences lock") = sequences;
        Ok(())
    }

    /// Adopts current offsets from driver-persisted state when present,
    /// otherwise from the first sequence's start.
    async fn adopt_driver_metadata(&mut self) -> Result<()> {
        let restored = self.driver.start_job().await?;
        let io = &self.config().io;

        match restored {
            None => {
                // brand-new task or replacement of a failed one; the restored
                // sequences must not start before the task's own bounds
                let sequences = self.shared.sequences.lock().expect("sequences lock");
                let first = sequences.first().expect("at least one sequence");
                for (partition, sequence) in &first.start_offsets {
                    let task_start = io.start_partitions.partitions.get(partition);
                    if !matches!(task_start, Some(start) if sequence >= start) {
                        return Err(Error::Runner(format!(
                            "Sequence offsets are not compatible with start offsets of task \
                             (partition [{partition}], sequence start [{sequence}])"
                        )));
                    }
                }
                let start = first.start_offsets.clone();
                drop(sequences);
                self.shared
                    .curr_offsets
                    .lock()
                    .expect("offsets lock")
                    .extend(start);
            }
            Some(commit) => {
                if commit.next_partitions.stream != io.stream() {
                    return Err(Error::Runner(format!(
                        "Restored stream [{}] but expected [{}]",
                        commit.next_partitions.stream,
                        io.stream()
                    )));
                }
                let restored_offsets = commit.next_partitions.partitions;
                let expected: HashSet<_> = io.start_partitions.partitions.keys().collect();
                let found: HashSet<_> = restored_offsets.keys().collect();
                if expected != found {
                    return Err(Error::Runner(format!(
                        "Restored partitions {found:?} but expected {expected:?}"
                    )));
                }
                self.shared
                    .curr_offsets
                    .lock()
                    .expect("offsets lock")
                    .extend(restored_offsets);

                // a fully checkpointed tail means the end offsets were
                // finalized before the restart
                let sequences = self.shared.sequences.lock().expect("sequences lock");
                let finalized_end = match sequences.last() {
                    None => Some(self.shared.curr()),
                    Some(last) if last.checkpointed => Some(last.end_offsets.clone()),
                    Some(_) => None,
                };
                drop(sequences);
                if let Some(end) = finalized_end {
                    info!(?end, "End offsets restored from persisted sequences");
                    self.shared
                        .end_offsets
                        .lock()
                        .expect("offsets lock")
                        .extend(end);
                }
            }
        }
        Ok(())
    }

    /// Builds the working set from current vs end positions and pushes it to
    /// the supplier. A partition whose current position has passed its end
    /// is corrupt state and fails the task.
    async fn assign_partitions(&mut self) -> Result<HashSet<StreamPartition>> {
        let curr = self.shared.curr();
        let end = self.shared.end();
        let stream = self.stream();

        let mut assignment = HashSet::new();
        for (partition, current) in &curr {
            let Some(end_sequence) = end.get(partition) else {
                return Err(Error::Runner(format!(
                    "No end offset known for partition [{partition}]"
                )));
            };
            if *current == SequenceNumber::EndOfShard {
                continue;
            }
            if *end_sequence == SequenceNumber::EndOfShard
                || *end_sequence == SequenceNumber::NoEnd
                || current < end_sequence
            {
                assignment.insert(StreamPartition::new(stream.clone(), partition.clone()));
            } else if current == end_sequence {
                info!(%partition, "Finished reading partition");
            } else {
                return Err(Error::Runner(format!(
                    "Invalid bounds: cannot start from [{current}] > end [{end_sequence}] \
                     for partition [{partition}]"
                )));
            }
        }

        self.supplier.assign(assignment.clone()).await?;
        Ok(assignment)
    }

    /// Verifies every assigned partition's start is still within retention;
    /// on loss, either asks for a metadata reset or fails the task.
    async fn check_sequence_availability(
        &mut self,
        assignment: &HashSet<StreamPartition>,
    ) -> Result<()> {
        if self.config().tuning.skip_sequence_number_availability_check {
            return Ok(());
        }

        let mut unavailable: Vec<(StreamPartition, SequenceNumber, SequenceNumber)> = Vec::new();
        for partition in assignment {
            let current = self
                .shared
                .curr()
                .get(&partition.partition_id)
                .cloned()
                .expect("assigned partition has a current offset");
            let earliest = self
                .supplier
                .earliest_sequence_number(partition.clone())
                .await?;
            match earliest {
                Some(earliest) if earliest <= current => {}
                Some(earliest) => {
                    warn!(
                        partition = %partition,
                        %current,
                        %earliest,
                        "Starting sequence number is no longer available"
                    );
                    unavailable.push((partition.clone(), current, earliest));
                }
                None => {
                    return Err(Error::Runner(format!(
                        "Timed out fetching earliest sequence number for partition [{partition}]"
                    )));
                }
            }
        }

        let Some((first_partition, first_current, first_earliest)) = unavailable.first().cloned()
        else {
            return Ok(());
        };

        if self.config().tuning.reset_offset_automatically {
            info!("Attempting to reset offsets automatically for all partitions");
            let offsets: OffsetMap = unavailable
                .into_iter()
                .map(|(partition, current, _)| (partition.partition_id, current))
                .collect();
            let metadata = self.metadata_for(offsets);
            let accepted = self
                .actions
                .reset_metadata(&self.config().datasource, Some(metadata))
                .await?;
            if accepted {
                warn!(
                    datasource = self.config().datasource,
                    "Reset offsets for datasource; pausing until the supervisor reacts"
                );
                self.shared.request_pause();
                Ok(())
            } else {
                Err(Error::Runner(
                    "Failed to send reset request for unavailable partitions".to_string(),
                ))
            }
        } else {
            Err(Error::StartSequenceUnavailable {
                partition: first_partition.to_string(),
                start: first_current.to_string(),
                earliest: first_earliest.to_string(),
            })
        }
    }

    async fn seek_to_current(&mut self, assignment: &HashSet<StreamPartition>) -> Result<()> {
        let curr = self.shared.curr();
        for partition in assignment {
            let sequence = curr
                .get(&partition.partition_id)
                .cloned()
                .expect("assigned partition has a current offset");
            info!(partition = %partition, %sequence, "Seeking partition");
            self.supplier.seek(partition.clone(), sequence).await?;
        }
        Ok(())
    }

    /// Parks while a pause is requested. Returns true if the loop paused and
    /// resumed, in which case partition assignments may have changed.
    async fn possibly_pause(&self) -> bool {
        if !*self.shared.pause_requested_tx.borrow() {
            return false;
        }
        self.shared.status_tx.send_replace(Status::Paused);
        info!("Pausing ingestion until resumed");
        let mut rx = self.shared.pause_requested_tx.subscribe();
        let _ = rx.wait_for(|requested| !requested).await;
        self.shared.status_tx.send_replace(Status::Reading);
        info!("Ingestion loop resumed");
        true
    }

    async fn read_loop(
        &mut self,
        assignment: &mut HashSet<StreamPartition>,
        still_reading: &mut bool,
    ) -> Result<()> {
        while *still_reading {
            if self.possibly_pause().await {
                // assignments may have changed while paused by a call to
                // set_end_offsets, so rebuild them before polling again
                *assignment = self.assign_partitions().await?;
                self.check_sequence_availability(assignment).await?;
                self.seek_to_current(assignment).await?;

                if assignment.is_empty() {
                    info!("All partitions have been fully read");
                    self.shared.publish_on_stop.store(true, Ordering::SeqCst);
                    self.shared.stop_requested.store(true, Ordering::SeqCst);
                }
            }

            let latest_checkpointed = self
                .shared
                .sequences
                .lock()
                .expect("sequences lock")
                .last()
                .map(|s| s.checkpointed)
                .unwrap_or(false);
            if self.shared.stop_requested.load(Ordering::SeqCst) || latest_checkpointed {
                return Ok(());
            }

            if let Some(error) = self.shared.take_background_error() {
                return Err(error);
            }

            self.check_publish_and_handoff_failure().await?;
            self.maybe_persist_and_publish().await?;

            let records = self.supplier.poll(self.config().tuning.poll_timeout).await?;
            *still_reading = !assignment.is_empty();

            let mut sequence_to_checkpoint: Option<SequenceMetadata> = None;
            for record in records {
                self.process_record(
                    record,
                    assignment,
                    still_reading,
                    &mut sequence_to_checkpoint,
                )
                .await?;
            }

            let checkpoint_due = Instant::now()
                >= *self
                    .shared
                    .next_checkpoint_time
                    .lock()
                    .expect("checkpoint lock");
            if checkpoint_due {
                sequence_to_checkpoint = self
                    .shared
                    .sequences
                    .lock()
                    .expect("sequences lock")
                    .last()
                    .cloned();
            }

            if let Some(sequence) = sequence_to_checkpoint {
                if *still_reading {
                    self.request_checkpoint(sequence).await?;
                }
            }
        }
        Ok(())
    }

    async fn process_record(
        &mut self,
        record: StreamRecord,
        assignment: &mut HashSet<StreamPartition>,
        still_reading: &mut bool,
        sequence_to_checkpoint: &mut Option<SequenceMetadata>,
    ) -> Result<()> {
        if !self.verify_initial_record(&record)? {
            return Ok(());
        }

        debug!(
            stream = record.stream,
            partition = %record.partition_id,
            sequence = %record.sequence_number,
            "Got record"
        );

        if record.is_end_of_shard() {
            self.shared
                .curr_offsets
                .lock()
                .expect("offsets lock")
                .insert(record.partition_id.clone(), SequenceNumber::EndOfShard);
        } else {
            let end_sequence = self
                .shared
                .end()
                .get(&record.partition_id)
                .cloned()
                .ok_or_else(|| {
                    Error::Runner(format!(
                        "Record for unknown partition [{}]",
                        record.partition_id
                    ))
                })?;

            if record.sequence_number < end_sequence {
                self.check_offset_gap(&record)?;
                self.ingest_record(&record, sequence_to_checkpoint).await?;
                let next = record.sequence_number.next();
                self.shared
                    .curr_offsets
                    .lock()
                    .expect("offsets lock")
                    .insert(record.partition_id.clone(), next);
            }
        }

        // retire the partition once its current position reaches the end
        let current = self
            .shared
            .curr()
            .get(&record.partition_id)
            .cloned();
        let end = self.shared.end().get(&record.partition_id).cloned();
        let finished = current == Some(SequenceNumber::EndOfShard)
            || (current.is_some() && current == end);
        if finished {
            let stream_partition = record.stream_partition();
            if assignment.remove(&stream_partition) {
                info!(partition = %stream_partition, "Finished reading partition");
                self.supplier.assign(assignment.clone()).await?;
                *still_reading = !assignment.is_empty();
            }
        }
        Ok(())
    }

    /// The first record of each partition must sit exactly at the expected
    /// start. Returns false when the record is the excluded exclusive-start
    /// position and must be skipped.
    fn verify_initial_record(&self, record: &StreamRecord) -> Result<bool> {
        let mut snapshot = self
            .shared
            .initial_offsets_snapshot
            .lock()
            .expect("offsets lock");
        let Some(expected) = snapshot.get(&record.partition_id) else {
            return Ok(true);
        };

        // The snapshot entry is removed on first contact, so a mismatch can
        // only happen if the offsets were changed underneath us.
        if *expected != record.sequence_number {
            return Err(Error::Runner(format!(
                "Starting sequence number [{}] does not match expected [{expected}] for \
                 partition [{}]",
                record.sequence_number, record.partition_id
            )));
        }

        info!(
            partition = %record.partition_id,
            sequence = %record.sequence_number,
            "Verified starting sequence number"
        );
        snapshot.remove(&record.partition_id);
        if snapshot.is_empty() {
            info!("Verified starting offsets for all partitions");
        }
        drop(snapshot);

        if self
            .config()
            .io
            .exclusive_start_partitions
            .contains(&record.partition_id)
        {
            info!(
                partition = %record.partition_id,
                "Skipping starting sequence number for partition marked exclusive"
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Integer-offset streams are expected to be gapless below the end
    /// bound; opaque-sequence streams are not.
    fn check_offset_gap(&self, record: &StreamRecord) -> Result<()> {
        if self.config().kind != crate::metadata::StreamKind::Kafka {
            return Ok(());
        }
        let current = self.shared.curr().get(&record.partition_id).cloned();
        if current.as_ref() == Some(&record.sequence_number) {
            return Ok(());
        }
        let current = current.map(|s| s.to_string()).unwrap_or_default();
        if self.config().io.skip_offset_gaps {
            warn!(
                partition = %record.partition_id,
                sequence = %record.sequence_number,
                current,
                "Skipped ahead over an offset gap"
            );
            Ok(())
        } else {
            Err(Error::Runner(format!(
                "Got sequence [{}] after [{current}] in partition [{}]",
                record.sequence_number, record.partition_id
            )))
        }
    }

    async fn ingest_record(
        &mut self,
        record: &StreamRecord,
        sequence_to_checkpoint: &mut Option<SequenceMetadata>,
    ) -> Result<()> {
        let sequence = self
            .shared
            .sequences
            .lock()
            .expect("sequences lock")
            .iter()
            .find(|s| s.can_handle(record))
            .cloned()
            .ok_or_else(|| {
                Error::Runner(format!(
                    "Cannot find any valid sequence for record at partition [{}] sequence [{}]",
                    record.partition_id, record.sequence_number
                ))
            })?;

        for blob in &record.data {
            match self.parser.parse(blob) {
                Ok(rows) => {
                    for row in rows {
                        if !self.within_min_max_time(&row.timestamp) {
                            self.shared.meters.incr_thrown_away();
                            continue;
                        }
                        let result = self
                            .driver
                            .add(
                                row,
                                &sequence.sequence_name,
                                self.config().skip_segment_lineage_check(),
                            )
                            .await?;

                        if result.push_required && !sequence.checkpointed {
                            *sequence_to_checkpoint = Some(sequence.clone());
                        }
                        if result.persist_required {
                            let driver = self.driver.clone();
                            let commit = self.commit_metadata();
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = driver.persist(commit).await {
                                    error!(?e, "Incremental persist failed, dying");
                                    shared.set_background_error(e);
                                }
                            });
                        }
                        self.shared.meters.incr_processed();
                    }
                }
                Err(parse_error) => self.handle_parse_error(parse_error, record)?,
            }
        }
        Ok(())
    }

    fn within_min_max_time(&self, timestamp: &DateTime<Utc>) -> bool {
        let io = &self.config().io;
        if matches!(io.minimum_message_time, Some(min) if *timestamp < min) {
            return false;
        }
        if matches!(io.maximum_message_time, Some(max) if *timestamp > max) {
            return false;
        }
        true
    }

    fn handle_parse_error(&self, parse_error: ParseError, record: &StreamRecord) -> Result<()> {
        if parse_error.partially_valid {
            self.shared.meters.incr_processed_with_error();
        } else {
            self.shared.meters.incr_unparseable();
        }

        if self.config().tuning.log_parse_exceptions {
            error!(
                partition = %record.partition_id,
                sequence = %record.sequence_number,
                error = %parse_error,
                "Encountered parse exception on row"
            );
        }
        self.shared.saved_parse_failures.push(parse_error.message);

        if self.shared.meters.parse_failures() > self.config().tuning.max_parse_exceptions {
            error!("Max parse exceptions exceeded, terminating task");
            return Err(Error::MaxParseExceptionsExceeded);
        }
        Ok(())
    }

    /// Asks the supervisor (through the metadata action) to checkpoint the
    /// open sequence, pausing ourselves until it calls back with the new
    /// bounds.
    async fn request_checkpoint(&mut self, sequence: SequenceMetadata) -> Result<()> {
        {
            let sequences = self.shared.sequences.lock().expect("sequences lock");
            let latest = sequences.last().expect("at least one sequence");
            if latest.sequence_name != sequence.sequence_name {
                return Err(Error::Runner(format!(
                    "Cannot checkpoint a sequence [{}] which is not the latest one",
                    sequence.sequence_name
                )));
            }
        }

        self.shared.request_pause();

        let notice = CheckpointNotice {
            datasource: self.config().datasource.clone(),
            task_group_id: self.config().io.task_group_id,
            base_sequence_name: self.config().io.base_sequence_name.clone(),
            start_metadata: self.metadata_for(sequence.start_offsets.clone()),
            current_metadata: self.metadata_for(self.shared.curr()),
        };
        if !self.actions.checkpoint(notice).await? {
            return Err(Error::Runner(format!(
                "Checkpoint request with offsets [{:?}] failed, dying",
                self.shared.curr()
            )));
        }
        Ok(())
    }

    /// Queues any sequence whose partitions are all exhausted for publish
    /// while reading continues.
    async fn maybe_persist_and_publish(&mut self) -> Result<()> {
        let ready: Vec<SequenceMetadata> = {
            let curr = self.shared.curr();
            let mut sequences = self.shared.sequences.lock().expect("sequences lock");
            let mut ready = Vec::new();
            for sequence in sequences.iter_mut() {
                sequence.update_assignments(&curr);
                if !sequence.is_open()
                    && !self.publishing_sequences.contains(&sequence.sequence_name)
                {
                    ready.push(sequence.clone());
                }
            }
            ready
        };

        for sequence in ready {
            self.driver.persist(self.commit_metadata()).await?;
            info!(
                sequence = %sequence.sequence_name,
                "All assignments read, adding sequence to publish queue"
            );
            self.publishing_sequences
                .insert(sequence.sequence_name.clone());
            self.spawn_publish(sequence);
        }
        Ok(())
    }

    /// Reaps finished publish tasks; a failed publish fails the task.
    async fn check_publish_and_handoff_failure(&mut self) -> Result<()> {
        let mut index = 0;
        while index < self.publish_wait_list.len() {
            if !self.publish_wait_list[index].is_finished() {
                index += 1;
                continue;
            }
            let handle = self.publish_wait_list.swap_remove(index);
            let handoff = handle
                .await
                .map_err(|e| Error::Runner(format!("Publish task panicked: {e}")))??;
            self.handoff_wait_list.push(handoff);
        }
        Ok(())
    }

    fn spawn_publish(&mut self, sequence: SequenceMetadata) {
        let driver = self.driver.clone();
        let actions = Arc::clone(&self.actions);
        let shared = Arc::clone(&self.shared);
        let datasource = self.config().datasource.clone();
        let use_transaction = self.config().io.use_transaction;
        let kind = self.config().kind;
        let stream = self.stream();

        let handle = tokio::spawn(async move {
            info!(sequence = %sequence.sequence_name, "Publishing segments for sequence");
            let segments = driver
                .publish_segments(vec![sequence.sequence_name.clone()])
                .await?;

            let action = if use_transaction {
                SegmentTransactionalInsert {
                    segments: segments.clone(),
                    start_metadata: Some(DataSourceMetadata::new(
                        kind,
                        StreamPartitions::new(stream.clone(), sequence.start_offsets.clone()),
                    )),
                    end_metadata: Some(DataSourceMetadata::new(
                        kind,
                        StreamPartitions::new(stream.clone(), sequence.end_offsets.clone()),
                    )),
                }
            } else {
                SegmentTransactionalInsert {
                    segments: segments.clone(),
                    start_metadata: None,
                    end_metadata: None,
                }
            };

            info!(use_transaction, "Publishing with transaction");
            let accepted = actions
                .segment_transactional_insert(&datasource, action)
                .await?;
            if !accepted {
                return Err(Error::PublishTransaction(sequence.sequence_name.clone()));
            }
            info!(
                sequence = %sequence.sequence_name,
                segments = ?segments,
                "Published segments"
            );

            let snapshot = {
                let mut sequences = shared.sequences.lock().expect("sequences lock");
                sequences.retain(|s| s.sequence_name != sequence.sequence_name);
                sequences.clone()
            };
            sequences::persist(&shared.persist_dir, &snapshot).await?;

            driver.register_handoff(segments).await
        });
        self.publish_wait_list.push(handle);
    }

    async fn publish_remaining_sequences(&mut self) -> Result<()> {
        let remaining: Vec<SequenceMetadata> = {
            let curr = self.shared.curr();
            let mut sequences = self.shared.sequences.lock().expect("sequences lock");
            let mut remaining = Vec::new();
            for sequence in sequences.iter_mut() {
                if self.publishing_sequences.contains(&sequence.sequence_name) {
                    continue;
                }
                // commit only what was actually read
                sequence.finalize_end_at(&curr);
                sequence.update_assignments(&curr);
                remaining.push(sequence.clone());
            }
            remaining
        };
        for sequence in remaining {
            self.publishing_sequences
                .insert(sequence.sequence_name.clone());
            self.spawn_publish(sequence);
        }

        if let Some(error) = self.shared.take_background_error() {
            return Err(error);
        }
        Ok(())
    }

    async fn await_publishes(&mut self) -> Result<()> {
        for mut handle in std::mem::take(&mut self.publish_wait_list) {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => {
                    handle.abort();
                    return Err(Error::StoppedWithoutPublishing);
                }
                joined = &mut handle => {
                    let handoff = joined
                        .map_err(|e| Error::Runner(format!("Publish task panicked: {e}")))??;
                    self.handoff_wait_list.push(handoff);
                }
            }
        }
        Ok(())
    }

    /// Waits for registered handoffs. A timeout is an alert, not a failure:
    /// publish already succeeded, handoff is a serving concern.
    async fn await_handoffs(&mut self) -> Result<()> {
        let receivers = std::mem::take(&mut self.handoff_wait_list);
        let wait_all = async {
            for receiver in receivers {
                if receiver.await.is_err() {
                    warn!("Handoff watcher went away before completion");
                }
            }
        };

        let handoff_timeout = self.config().tuning.handoff_condition_timeout;
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(Error::StoppedWithoutPublishing),
            outcome = async {
                if handoff_timeout.is_zero() {
                    wait_all.await;
                    true
                } else {
                    tokio::time::timeout(handoff_timeout, wait_all).await.is_ok()
                }
            } => {
                if !outcome {
                    warn!(
                        timeout_ms = handoff_timeout.as_millis() as u64,
                        "Timed out waiting for handoffs; publish already succeeded"
                    );
                }
                Ok(())
            }
        }
    }
}

impl<M: MetadataActionClient> TaskRunner<M> {
    /// Spawns the run loop; the handle stays valid after completion.
    pub fn spawn(self) -> (RunnerHandle, JoinHandle<TaskReport>) {
        let handle = self.handle();
        let join = tokio::spawn(self.run());
        (handle, join)
    }
}

#[cfg(test)]
mod tests;
