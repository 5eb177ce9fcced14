//! Per-datasource controller. The supervisor discovers stream partitions,
//! plans task groups over them, submits and adopts tasks, drives the
//! duration-based handoff from one task generation to the next, replaces
//! failed replicas, and answers checkpoint requests from its tasks.
//!
//! Everything runs on a single notice loop: a periodic tick enqueues the
//! run duty, and external commands (checkpoint, reset, suspend, status)
//! arrive through the same mailbox, so state is only ever touched from one
//! task.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::{CheckpointNotice, MetadataActionClient};
use crate::config::supervisor::SupervisorConfig;
use crate::config::task::{TaskConfig, TaskIoConfig};
use crate::message::StreamPartition;
use crate::metadata::{DataSourceMetadata, StreamPartitions};
use crate::runner::sequences::OffsetMap;
use crate::sequence::{PartitionId, SequenceNumber};
use crate::supplier::Supplier;
use crate::{Error, Result};

pub mod client;
pub mod http;
pub mod task_group;

use client::{TaskClient, TaskQueue, TaskState, TaskSummary};
use task_group::{group_id_for, OffsetSource, PendingCompletionGroup, TaskGroup};

const CHAT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Commands processed by the notice loop.
enum Notice {
    Run,
    Checkpoint(CheckpointNotice),
    Reset {
        metadata: Option<DataSourceMetadata>,
        respond_to: oneshot::Sender<Result<bool>>,
    },
    Suspend {
        respond_to: oneshot::Sender<()>,
    },
    ResumeSupervision {
        respond_to: oneshot::Sender<()>,
    },
    Status {
        respond_to: oneshot::Sender<SupervisorReport>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReport {
    pub group_id: i32,
    pub base_sequence_name: String,
    pub task_ids: Vec<String>,
    pub start_offsets: OffsetMap,
    pub offset_source: OffsetSource,
    /// Seconds of reading time left before the duration handoff; absent for
    /// groups that have not reported a start time yet.
    pub remaining_seconds: Option<i64>,
    /// Latest stream position minus the leader's current position, per
    /// partition; only integer-offset streams have a computable lag.
    pub lag: BTreeMap<PartitionId, Option<i64>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorReport {
    pub datasource: String,
    pub stream: String,
    pub suspended: bool,
    pub active_groups: Vec<GroupReport>,
    pub publishing_groups: Vec<GroupReport>,
}

/// Command surface of a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    notice_tx: mpsc::Sender<Notice>,
    cancel: CancellationToken,
}

impl SupervisorHandle {
    /// Routes a task-initiated checkpoint into the notice loop.
    pub async fn checkpoint(&self, notice: CheckpointNotice) -> Result<()> {
        self.notice_tx
            .send(Notice::Checkpoint(notice))
            .await
            .map_err(|_| Error::Supervisor("supervisor has shut down".to_string()))
    }

    /// `None` clears the whole stored commit; `Some` removes the named
    /// partitions. Tasks in affected groups are killed.
    pub async fn reset(&self, metadata: Option<DataSourceMetadata>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.notice_tx
            .send(Notice::Reset {
                metadata,
                respond_to: tx,
            })
            .await
            .map_err(|_| Error::Supervisor("supervisor has shut down".to_string()))?;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    pub async fn suspend(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.notice_tx
            .send(Notice::Suspend { respond_to: tx })
            .await
            .map_err(|_| Error::Supervisor("supervisor has shut down".to_string()))?;
        rx.await.map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    pub async fn resume_supervision(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.notice_tx
            .send(Notice::ResumeSupervision { respond_to: tx })
            .await
            .map_err(|_| Error::Supervisor("supervisor has shut down".to_string()))?;
        rx.await.map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    pub async fn status(&self) -> Result<SupervisorReport> {
        let (tx, rx) = oneshot::channel();
        self.notice_tx
            .send(Notice::Status { respond_to: tx })
            .await
            .map_err(|_| Error::Supervisor("supervisor has shut down".to_string()))?;
        rx.await.map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    /// Stops the notice loop. Running tasks are left as they are.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

pub struct Supervisor<C: TaskClient, Q: TaskQueue, M: MetadataActionClient> {
    config: SupervisorConfig,
    supplier: Supplier,
    task_client: Arc<C>,
    task_queue: Arc<Q>,
    actions: Arc<M>,
    active_groups: BTreeMap<i32, TaskGroup>,
    pending_completion: BTreeMap<i32, Vec<PendingCompletionGroup>>,
    discovered_partitions: BTreeSet<PartitionId>,
    suspended: bool,
}

impl<C: TaskClient, Q: TaskQueue, M: MetadataActionClient> Supervisor<C, Q, M> {
    pub fn new(
        config: SupervisorConfig,
        supplier: Supplier,
        task_client: Arc<C>,
        task_queue: Arc<Q>,
        actions: Arc<M>,
    ) -> Self {
        Self {
            config,
            supplier,
            task_client,
            task_queue,
            actions,
            active_groups: BTreeMap::new(),
            pending_completion: BTreeMap::new(),
            discovered_partitions: BTreeSet::new(),
            suspended: false,
        }
    }

    /// Starts the notice loop after the configured start delay.
    pub fn spawn(mut self) -> SupervisorHandle {
        let (notice_tx, mut notice_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = SupervisorHandle {
            notice_tx,
            cancel: cancel.clone(),
        };

        let start_delay = self.config.start_delay;
        let period = self.config.period;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(start_delay) => {}
                _ = cancel.cancelled() => return,
            }
            info!(
                datasource = self.config.datasource,
                stream = self.config.stream,
                "Supervisor started"
            );

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.run_tick().await {
                            error!(?e, "Supervisor tick failed, will retry next period");
                        }
                    }
                    notice = notice_rx.recv() => {
                        let Some(notice) = notice else { break };
                        self.handle_notice(notice).await;
                    }
                }
            }
            info!(datasource = self.config.datasource, "Supervisor stopped");
        });
        handle
    }

    async fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Run => {
                if let Err(e) = self.run_tick().await {
                    error!(?e, "Supervisor tick failed, will retry next period");
                }
            }
            Notice::Checkpoint(checkpoint) => {
                if let Err(e) = self.handle_checkpoint(checkpoint).await {
                    error!(?e, "Failed to handle checkpoint request");
                }
            }
            Notice::Reset {
                metadata,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_reset(metadata).await);
            }
            Notice::Suspend { respond_to } => {
                info!(datasource = self.config.datasource, "Suspending supervision");
                self.suspended = true;
                let _ = respond_to.send(());
            }
            Notice::ResumeSupervision { respond_to } => {
                info!(datasource = self.config.datasource, "Resuming supervision");
                self.suspended = false;
                let _ = respond_to.send(());
            }
            Notice::Status { respond_to } => {
                let _ = respond_to.send(self.build_report().await);
            }
        }
    }

    async fn run_tick(&mut self) -> Result<()> {
        // stream-transient failures are logged and retried next tick
        match self.supplier.partition_ids(self.config.stream.clone()).await {
            Ok(partitions) => {
                self.discovered_partitions = partitions.into_iter().collect();
            }
            Err(e) => {
                warn!(?e, stream = self.config.stream, "Unable to list stream partitions");
                return Ok(());
            }
        }

        let task_states = self.refresh_task_states().await?;
        self.discover_tasks(&task_states).await?;
        self.update_task_start_times().await;

        if self.suspended {
            let active: Vec<i32> = self.active_groups.keys().copied().collect();
            for group_id in active {
                self.finish_group(group_id, false).await;
            }
        } else {
            self.check_task_durations().await;
        }

        self.manage_pending_completion(&task_states).await;

        if !self.suspended {
            self.ensure_task_groups().await?;
            self.ensure_replicas().await;
        }
        Ok(())
    }

    async fn refresh_task_states(&self) -> Result<HashMap<String, TaskState>> {
        let summaries = self.task_queue.list(&self.config.datasource).await?;
        Ok(summaries
            .into_iter()
            .map(|TaskSummary { task_id, state }| (task_id, state))
            .collect())
    }

    /// Classifies every task the orchestrator knows about: terminal replicas
    /// are dropped (failed ones get replaced later), unknown running tasks
    /// are adopted when they exactly cover one of our groups and killed
    /// otherwise.
    async fn discover_tasks(&mut self, task_states: &HashMap<String, TaskState>) -> Result<()> {
        for (task_id, state) in task_states {
            match state {
                TaskState::Failed => {
                    for group in self.active_groups.values_mut() {
                        if group.replica_task_ids.remove(task_id) {
                            warn!(
                                task_id,
                                group_id = group.group_id,
                                "Replica failed while reading, will recreate"
                            );
                        }
                    }
                }
                TaskState::Success => {
                    // a task that published on its own retires its group;
                    // the next tick replans from the stored commit
                    let finished: Vec<i32> = self
                        .active_groups
                        .values()
                        .filter(|g| g.replica_task_ids.contains(task_id))
                        .map(|g| g.group_id)
                        .collect();
                    for group_id in finished {
                        info!(task_id, group_id, "Task published and exited, retiring group");
                        if let Some(group) = self.active_groups.remove(&group_id) {
                            self.kill_group_tasks(&group, Some(task_id.as_str())).await;
                        }
                    }
                }
                TaskState::Pending | TaskState::Running => {
                    if self.is_tracked(task_id) {
                        continue;
                    }
                    self.maybe_adopt_task(task_id).await?;
                }
            }
        }
        Ok(())
    }

    fn is_tracked(&self, task_id: &str) -> bool {
        self.active_groups
            .values()
            .any(|g| g.replica_task_ids.contains(task_id))
            || self
                .pending_completion
                .values()
                .flatten()
                .any(|p| p.group.replica_task_ids.contains(task_id))
    }

    async fn maybe_adopt_task(&mut self, task_id: &str) -> Result<()> {
        let Some(config) = self.task_queue.config(task_id).await? else {
            return Ok(());
        };
        if config.datasource != self.config.datasource
            || config.io.stream() != self.config.stream
        {
            return Ok(());
        }

        let group_id = config.io.task_group_id;
        let expected: HashSet<PartitionId> = self
            .discovered_partitions
            .iter()
            .filter(|p| group_id_for(p, self.config.task_count) == group_id)
            .cloned()
            .collect();
        let covered: HashSet<PartitionId> = config
            .io
            .start_partitions
            .partitions
            .keys()
            .cloned()
            .collect();

        if covered != expected {
            warn!(
                task_id,
                group_id, "Killing task with a partition set that does not match its group"
            );
            let _ = self.task_queue.shutdown(task_id).await;
            return Ok(());
        }

        match self.active_groups.get_mut(&group_id) {
            Some(group) if group.base_sequence_name == config.io.base_sequence_name => {
                info!(task_id, group_id, "Adopting replica into existing group");
                group.replica_task_ids.insert(task_id.to_string());
            }
            Some(_) => {
                warn!(
                    task_id,
                    group_id, "Killing task from a different task generation"
                );
                let _ = self.task_queue.shutdown(task_id).await;
            }
            None => {
                info!(task_id, group_id, "Adopting task as a new group");
                let mut group = TaskGroup::new(
                    group_id,
                    config.io.base_sequence_name.clone(),
                    config.io.start_partitions.partitions.clone(),
                    OffsetSource::AdoptedTask,
                    config.io.minimum_message_time,
                    config.io.maximum_message_time,
                );
                group.replica_task_ids.insert(task_id.to_string());
                self.active_groups.insert(group_id, group);
            }
        }
        Ok(())
    }

    /// Records the earliest replica start time per group; a replica that
    /// exhausts the chat retry budget is killed and replaced.
    async fn update_task_start_times(&mut self) {
        let chat_retries = self.config.chat_retries;
        let mut to_kill: Vec<(i32, String)> = Vec::new();

        for group in self.active_groups.values_mut() {
            if group.earliest_task_start.is_some() {
                continue;
            }
            for task_id in group.replica_task_ids.iter() {
                let client = Arc::clone(&self.task_client);
                let result = with_chat_retries(chat_retries, || {
                    let client = Arc::clone(&client);
                    let task_id = task_id.clone();
                    async move { client.start_time(&task_id).await }
                })
                .await;
                match result {
                    Ok(Some(start_time)) => {
                        let earliest = group.earliest_task_start.get_or_insert(start_time);
                        if start_time < *earliest {
                            *earliest = start_time;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(task_id, ?e, "Task unresponsive, shutting it down");
                        to_kill.push((group.group_id, task_id.clone()));
                    }
                }
            }
        }

        for (group_id, task_id) in to_kill {
            let _ = self.task_queue.shutdown(&task_id).await;
            if let Some(group) = self.active_groups.get_mut(&group_id) {
                group.replica_task_ids.remove(&task_id);
            }
        }
    }

    async fn check_task_durations(&mut self) {
        let now = Utc::now();
        let expired: Vec<i32> = self
            .active_groups
            .values()
            .filter(|group| {
                matches!(
                    group.earliest_task_start,
                    Some(start) if now.signed_duration_since(start).to_std().unwrap_or_default()
                        >= self.config.task_duration
                )
            })
            .map(|group| group.group_id)
            .collect();

        for group_id in expired {
            info!(group_id, "Task group has read for its full duration, signalling completion");
            self.finish_group(group_id, true).await;
        }
    }

    /// Pauses every replica, finalizes their end offsets at the furthest
    /// position any replica reached, and moves the group into pending
    /// completion. With `spawn_successor` a new group picks up from those
    /// offsets immediately.
    async fn finish_group(&mut self, group_id: i32, spawn_successor: bool) {
        let Some(mut group) = self.active_groups.remove(&group_id) else {
            return;
        };
        let chat_retries = self.config.chat_retries;

        let mut collected: Vec<OffsetMap> = Vec::new();
        let mut alive: HashSet<String> = HashSet::new();
        for task_id in group.replica_task_ids.iter() {
            let client = Arc::clone(&self.task_client);
            let result = with_chat_retries(chat_retries, || {
                let client = Arc::clone(&client);
                let task_id = task_id.clone();
                async move { client.pause(&task_id).await }
            })
            .await;
            match result {
                Ok(offsets) => {
                    collected.push(offsets);
                    alive.insert(task_id.clone());
                }
                Err(e) => {
                    error!(task_id, ?e, "Unable to pause replica, shutting it down");
                    let _ = self.task_queue.shutdown(task_id).await;
                }
            }
        }
        group.replica_task_ids = alive;

        if collected.is_empty() {
            warn!(group_id, "No replica could be paused; group dropped");
            return;
        }

        // replicas read identical data but may lag each other; finish all of
        // them at the furthest position reached
        let mut end_offsets: OffsetMap = OffsetMap::new();
        for offsets in &collected {
            for (partition, sequence) in offsets {
                match end_offsets.get(partition) {
                    Some(existing) if existing >= sequence => {}
                    _ => {
                        end_offsets.insert(partition.clone(), sequence.clone());
                    }
                }
            }
        }
        info!(group_id, ?end_offsets, "Finishing task group at collected offsets");

        let mut finished: HashSet<String> = HashSet::new();
        for task_id in group.replica_task_ids.iter() {
            let client = Arc::clone(&self.task_client);
            let offsets = end_offsets.clone();
            let result = with_chat_retries(chat_retries, || {
                let client = Arc::clone(&client);
                let task_id = task_id.clone();
                let offsets = offsets.clone();
                async move { client.set_end_offsets(&task_id, offsets, true).await }
            })
            .await;
            match result {
                Ok(()) => {
                    finished.insert(task_id.clone());
                }
                Err(e) => {
                    error!(task_id, ?e, "Unable to set end offsets, shutting replica down");
                    let _ = self.task_queue.shutdown(task_id).await;
                }
            }
        }
        group.replica_task_ids = finished;

        if spawn_successor {
            // closed shards have nothing further to read
            let successor_offsets: OffsetMap = end_offsets
                .iter()
                .filter(|(_, sequence)| **sequence != SequenceNumber::EndOfShard)
                .map(|(p, s)| (p.clone(), s.clone()))
                .collect();
            if !successor_offsets.is_empty() {
                let successor = self.plan_group(group_id, successor_offsets, OffsetSource::PriorTaskGroup);
                self.active_groups.insert(group_id, successor);
            }
        }

        if !group.replica_task_ids.is_empty() {
            self.pending_completion
                .entry(group_id)
                .or_default()
                .push(PendingCompletionGroup {
                    group,
                    deadline: Instant::now() + self.config.completion_timeout,
                });
        }
    }

    async fn manage_pending_completion(&mut self, task_states: &HashMap<String, TaskState>) {
        let mut to_kill: Vec<TaskGroup> = Vec::new();
        let mut failed_group_ids: Vec<i32> = Vec::new();

        for (group_id, pending_list) in self.pending_completion.iter_mut() {
            let mut kept = Vec::new();
            for pending in pending_list.drain(..) {
                let mut any_success = false;
                let mut any_alive = false;
                for task_id in &pending.group.replica_task_ids {
                    match task_states.get(task_id) {
                        Some(TaskState::Success) => any_success = true,
                        Some(TaskState::Pending | TaskState::Running) => any_alive = true,
                        Some(TaskState::Failed) | None => {}
                    }
                }

                if any_success {
                    info!(group_id, "Pending-completion group published successfully");
                    continue;
                }
                if !any_alive {
                    warn!(group_id, "All replicas of a publishing group died before publishing");
                    failed_group_ids.push(*group_id);
                    to_kill.push(pending.group);
                    continue;
                }
                if Instant::now() >= pending.deadline {
                    warn!(
                        group_id,
                        "Publishing group timed out; killing stragglers and replanning"
                    );
                    failed_group_ids.push(*group_id);
                    to_kill.push(pending.group);
                    continue;
                }
                kept.push(pending);
            }
            *pending_list = kept;
        }
        self.pending_completion.retain(|_, list| !list.is_empty());

        for group in to_kill {
            self.kill_group_tasks(&group, None).await;
        }
        // a failed publish invalidates the successor's starting offsets;
        // kill it too and let the next tick replan from stored metadata
        for group_id in failed_group_ids {
            if let Some(group) = self.active_groups.remove(&group_id) {
                self.kill_group_tasks(&group, None).await;
            }
        }
    }

    async fn kill_group_tasks(&self, group: &TaskGroup, except: Option<&str>) {
        for task_id in &group.replica_task_ids {
            if Some(task_id.as_str()) == except {
                continue;
            }
            if let Err(e) = self.task_queue.shutdown(task_id).await {
                warn!(task_id, ?e, "Failed to shut down task");
            }
        }
    }

    /// Creates groups for partitions that have none, starting from the
    /// stored commit when present, else from the configured stream bound.
    async fn ensure_task_groups(&mut self) -> Result<()> {
        let mut needed: BTreeMap<i32, Vec<PartitionId>> = BTreeMap::new();
        for partition in &self.discovered_partitions {
            needed
                .entry(group_id_for(partition, self.config.task_count))
                .or_default()
                .push(partition.clone());
        }

        let stored = self.stored_offsets().await?;

        for (group_id, partitions) in needed {
            if self.active_groups.contains_key(&group_id) {
                continue;
            }
            // wait for the previous generation's publish before replanning
            if self.pending_completion.contains_key(&group_id) {
                debug!(group_id, "Holding group planning until pending publish completes");
                continue;
            }

            let mut start_offsets = OffsetMap::new();
            let mut from_stream = false;
            for partition in partitions {
                match stored.get(&partition) {
                    Some(SequenceNumber::EndOfShard) => {
                        debug!(%partition, "Partition is fully read and closed, skipping");
                    }
                    Some(sequence) => {
                        start_offsets.insert(partition, sequence.clone());
                    }
                    None => {
                        from_stream = true;
                        let stream_partition =
                            StreamPartition::new(self.config.stream.clone(), partition.clone());
                        let probe = if self.config.use_earliest_sequence_number {
                            self.supplier.earliest_sequence_number(stream_partition).await
                        } else {
                            self.supplier.latest_sequence_number(stream_partition).await
                        };
                        match probe {
                            Ok(Some(SequenceNumber::EndOfShard)) => {
                                debug!(%partition, "Partition is closed and empty, skipping");
                            }
                            Ok(Some(sequence)) => {
                                start_offsets.insert(partition, sequence);
                            }
                            Ok(None) => {
                                warn!(%partition, "No sequence number surfaced, skipping this tick");
                            }
                            Err(e) => {
                                warn!(%partition, ?e, "Unable to probe stream bound, skipping this tick");
                            }
                        }
                    }
                }
            }

            if start_offsets.is_empty() {
                continue;
            }
            let offset_source = if from_stream {
                if self.config.use_earliest_sequence_number {
                    OffsetSource::EarliestInStream
                } else {
                    OffsetSource::LatestInStream
                }
            } else {
                OffsetSource::StoredMetadata
            };
            let group = self.plan_group(group_id, start_offsets, offset_source);
            info!(
                group_id,
                base_sequence_name = group.base_sequence_name,
                ?group.start_offsets,
                "Planned new task group"
            );
            self.active_groups.insert(group_id, group);
        }
        Ok(())
    }

    /// Reads and validates the stored commit; a commit for a different
    /// flavor or stream means corrupt metadata and fails the tick hard.
    async fn stored_offsets(&self) -> Result<OffsetMap> {
        let Some(stored) = self.actions.get_metadata(&self.config.datasource).await? else {
            return Ok(OffsetMap::new());
        };
        if stored.kind != self.config.kind || stored.partitions.stream != self.config.stream {
            return Err(Error::Metadata(format!(
                "Stored metadata for [{}] does not match supervisor (kind [{:?}], stream [{}])",
                self.config.datasource, stored.kind, stored.partitions.stream
            )));
        }
        Ok(stored.partitions.partitions)
    }

    fn plan_group(
        &self,
        group_id: i32,
        start_offsets: OffsetMap,
        offset_source: OffsetSource,
    ) -> TaskGroup {
        let now = Utc::now();
        let minimum_message_time = self.config.late_message_rejection_period.map(|period| {
            now - chrono::Duration::from_std(period).unwrap_or_default()
        });
        let maximum_message_time = self.config.early_message_rejection_period.map(|period| {
            let window = self.config.task_duration + period;
            now + chrono::Duration::from_std(window).unwrap_or_default()
        });

        TaskGroup::new(
            group_id,
            format!(
                "index_{}_{}_{}",
                self.config.datasource,
                group_id,
                random_suffix(6)
            ),
            start_offsets,
            offset_source,
            minimum_message_time,
            maximum_message_time,
        )
    }

    /// Tops groups up to the configured replica count. Replacements inherit
    /// the group's bounds and checkpoint history.
    async fn ensure_replicas(&mut self) {
        let mut submissions: Vec<(i32, TaskConfig)> = Vec::new();
        for group in self.active_groups.values() {
            let mut count = group.replica_task_ids.len();
            while count < self.config.replicas {
                submissions.push((group.group_id, self.task_config_for(group)));
                count += 1;
            }
        }

        for (group_id, config) in submissions {
            let task_id = config.task_id.clone();
            info!(task_id, group_id, "Submitting task");
            match self.task_queue.submit(config).await {
                Ok(()) => {
                    if let Some(group) = self.active_groups.get_mut(&group_id) {
                        group.replica_task_ids.insert(task_id);
                    }
                }
                Err(e) => {
                    error!(task_id, ?e, "Failed to submit task");
                }
            }
        }
    }

    fn task_config_for(&self, group: &TaskGroup) -> TaskConfig {
        let end_partitions: OffsetMap = group
            .start_offsets
            .keys()
            .map(|partition| (partition.clone(), SequenceNumber::NoEnd))
            .collect();
        let context_checkpoints = if group.checkpoint_history.len() > 1 {
            Some(
                group
                    .checkpoint_history
                    .iter()
                    .map(|(id, offsets)| {
                        (
                            *id,
                            StreamPartitions::new(self.config.stream.clone(), offsets.clone()),
                        )
                    })
                    .collect(),
            )
        } else {
            None
        };

        TaskConfig {
            task_id: format!("{}_{}", group.base_sequence_name, random_suffix(4)),
            datasource: self.config.datasource.clone(),
            kind: self.config.kind,
            io: TaskIoConfig {
                task_group_id: group.group_id,
                base_sequence_name: group.base_sequence_name.clone(),
                start_partitions: StreamPartitions::new(
                    self.config.stream.clone(),
                    group.start_offsets.clone(),
                ),
                end_partitions: StreamPartitions::new(self.config.stream.clone(), end_partitions),
                exclusive_start_partitions: group.exclusive_start_partitions.clone(),
                use_transaction: true,
                skip_offset_gaps: false,
                minimum_message_time: group.minimum_message_time,
                maximum_message_time: group.maximum_message_time,
            },
            tuning: self.config.task_tuning.clone(),
            context_checkpoints,
        }
    }

    /// A task hit a segment boundary (or its checkpoint period) and asked
    /// for a new sequence: record the checkpoint and fan the new bounds out
    /// to every replica of the group.
    async fn handle_checkpoint(&mut self, notice: CheckpointNotice) -> Result<()> {
        let Some(group) = self.active_groups.values_mut().find(|group| {
            group.group_id == notice.task_group_id
                && group.base_sequence_name == notice.base_sequence_name
        }) else {
            warn!(
                group_id = notice.task_group_id,
                "Checkpoint request for an unknown task group, ignoring"
            );
            return Ok(());
        };

        let notice_start = notice.start_metadata.partitions.partitions;
        let latest_id = group.latest_checkpoint_id();
        let latest_start = group
            .checkpoint_history
            .get(&latest_id)
            .cloned()
            .unwrap_or_default();
        if latest_start != notice_start {
            if group
                .checkpoint_history
                .values()
                .any(|start| *start == notice_start)
            {
                info!(
                    group_id = group.group_id,
                    "Checkpoint already taken, ignoring duplicate request"
                );
            } else {
                warn!(
                    group_id = group.group_id,
                    "Checkpoint request does not match the group's history, ignoring"
                );
            }
            return Ok(());
        }

        let current = notice.current_metadata.partitions.partitions;
        group.checkpoint_history.insert(latest_id + 1, current.clone());
        info!(
            group_id = group.group_id,
            checkpoint_id = latest_id + 1,
            "Recorded checkpoint, propagating to replicas"
        );

        let replicas: Vec<String> = group.replica_task_ids.iter().cloned().collect();
        let group_id = group.group_id;
        let chat_retries = self.config.chat_retries;
        for task_id in replicas {
            let client = Arc::clone(&self.task_client);
            let offsets = current.clone();
            let result = with_chat_retries(chat_retries, || {
                let client = Arc::clone(&client);
                let task_id = task_id.clone();
                let offsets = offsets.clone();
                async move {
                    // the requester has asked itself to pause but may not
                    // have parked yet; wait for it before changing bounds
                    client.pause(&task_id).await?;
                    client.set_end_offsets(&task_id, offsets, false).await
                }
            })
            .await;
            match result {
                Ok(()) => {
                    // harmless when already reading; unparks a replica whose
                    // duplicate request returned before resuming
                    let _ = self.task_client.resume(&task_id).await;
                }
                Err(e) => {
                    error!(task_id, group_id, ?e, "Replica rejected checkpoint, shutting it down");
                    let _ = self.task_queue.shutdown(&task_id).await;
                    if let Some(group) = self.active_groups.get_mut(&group_id) {
                        group.replica_task_ids.remove(&task_id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_reset(&mut self, metadata: Option<DataSourceMetadata>) -> Result<bool> {
        if let Some(metadata) = &metadata {
            if metadata.kind != self.config.kind
                || metadata.partitions.stream != self.config.stream
            {
                return Err(Error::Metadata(format!(
                    "Reset metadata does not match supervisor stream [{}]",
                    self.config.stream
                )));
            }
        }

        let accepted = self
            .actions
            .reset_metadata(&self.config.datasource, metadata.clone())
            .await?;
        if !accepted {
            return Ok(false);
        }

        let affected: Vec<i32> = match &metadata {
            None => self.active_groups.keys().copied().collect(),
            Some(metadata) => self
                .active_groups
                .values()
                .filter(|group| {
                    metadata
                        .partitions
                        .partitions
                        .keys()
                        .any(|partition| group.partition_set().contains(partition))
                })
                .map(|group| group.group_id)
                .collect(),
        };
        for group_id in affected {
            info!(group_id, "Killing task group after metadata reset");
            if let Some(group) = self.active_groups.remove(&group_id) {
                self.kill_group_tasks(&group, None).await;
            }
        }
        Ok(true)
    }

    async fn build_report(&self) -> SupervisorReport {
        let mut active_groups = Vec::new();
        for group in self.active_groups.values() {
            active_groups.push(self.group_report(group, true).await);
        }
        let mut publishing_groups = Vec::new();
        for pending in self.pending_completion.values().flatten() {
            publishing_groups.push(self.group_report(&pending.group, false).await);
        }
        SupervisorReport {
            datasource: self.config.datasource.clone(),
            stream: self.config.stream.clone(),
            suspended: self.suspended,
            active_groups,
            publishing_groups,
        }
    }

    async fn group_report(&self, group: &TaskGroup, with_lag: bool) -> GroupReport {
        let remaining_seconds = group.earliest_task_start.map(|start| {
            let elapsed = Utc::now().signed_duration_since(start).num_seconds();
            self.config.task_duration.as_secs() as i64 - elapsed
        });

        let mut lag = BTreeMap::new();
        if with_lag {
            let current = match group.replica_task_ids.iter().next() {
                Some(task_id) => self
                    .task_client
                    .current_offsets(task_id)
                    .await
                    .unwrap_or_default(),
                None => OffsetMap::new(),
            };
            for partition in group.partition_set() {
                let stream_partition =
                    StreamPartition::new(self.config.stream.clone(), partition.clone());
                let latest = self
                    .supplier
                    .latest_sequence_number(stream_partition)
                    .await
                    .ok()
                    .flatten();
                let entry = match (latest, current.get(&partition)) {
                    (Some(SequenceNumber::Int(latest)), Some(SequenceNumber::Int(current))) => {
                        Some(latest - current)
                    }
                    _ => None,
                };
                lag.insert(partition, entry);
            }
        }

        GroupReport {
            group_id: group.group_id,
            base_sequence_name: group.base_sequence_name.clone(),
            task_ids: group.replica_task_ids.iter().cloned().collect(),
            start_offsets: group.start_offsets.clone(),
            offset_source: group.offset_source,
            remaining_seconds,
            lag,
        }
    }
}

async fn with_chat_retries<T, Fut>(
    retries: u32,
    mut op: impl FnMut() -> Fut,
) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..=retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt, ?e, "Task chat failed");
                last_error = Some(e);
            }
        }
        tokio::time::sleep(CHAT_RETRY_DELAY).await;
    }
    Err(last_error.expect("at least one attempt"))
}

fn random_suffix(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests;
