//! Shard fetchers and the drain-style poll surface.
//!
//! Each assigned shard gets one background fetcher which walks the shard
//! iterator and offers records into a bounded buffer. A full buffer rewinds
//! the fetcher to the first unoffered record; a closed shard produces one
//! end-of-shard marker and stops the fetcher. Seeks tear all fetchers down,
//! drop buffered records for the seeked shards only, and let the next poll
//! start a fresh generation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_kinesis::Client;
use aws_sdk_kinesis::config::Region;
use aws_sdk_kinesis::error::SdkError;
use aws_sdk_kinesis::operation::get_records::GetRecordsError;
use aws_sdk_kinesis::types::ShardIteratorType;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Error, KinesisSupplierConfig, Result, EXCEPTION_RETRY_DELAY, THROUGHPUT_BACKOFF};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardPartition {
    pub stream: String,
    pub shard_id: String,
}

impl ShardPartition {
    pub fn new(stream: impl Into<String>, shard_id: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            shard_id: shard_id.into(),
        }
    }
}

impl std::fmt::Display for ShardPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stream, self.shard_id)
    }
}

/// A record drained from the buffer. `sequence_number` of `None` is the
/// closed-shard marker, not data.
#[derive(Debug, Clone, PartialEq)]
pub struct KinesisRecord {
    pub stream: String,
    pub shard_id: String,
    pub sequence_number: Option<String>,
    pub data: Vec<Bytes>,
}

impl KinesisRecord {
    fn partition(&self) -> ShardPartition {
        ShardPartition::new(self.stream.clone(), self.shard_id.clone())
    }
}

/// Result of a non-consuming earliest/latest probe.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceProbe {
    At(String),
    /// The shard is closed and holds nothing at the requested bound.
    ShardClosed,
    /// No record surfaced within the configured fetch window; the shard is
    /// likely open but quiet.
    TimedOut,
}

/// Where the next fetcher generation resumes for a shard.
#[derive(Debug, Clone, PartialEq)]
enum ResumeFrom {
    AtSequence(String),
    AfterSequence(String),
    TrimHorizon,
    Latest,
    ShardClosed,
}

struct ShardState {
    resume: Arc<Mutex<ResumeFrom>>,
    started: bool,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ShardState {
    fn new(resume: ResumeFrom) -> Self {
        Self {
            resume: Arc::new(Mutex::new(resume)),
            started: false,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }
}

pub struct KinesisSupplier {
    client: Client,
    config: KinesisSupplierConfig,
    shards: HashMap<ShardPartition, ShardState>,
    buffer_tx: mpsc::Sender<KinesisRecord>,
    buffer_rx: mpsc::Receiver<KinesisRecord>,
    fetch_gate: Arc<Semaphore>,
    /// Position after the last record handed to a poll caller, per shard.
    /// A shard re-assigned after being dropped resumes from here.
    consumed: HashMap<ShardPartition, ResumeFrom>,
    closed: bool,
}

impl KinesisSupplier {
    /// `client` overrides the environment-derived one; used by tests.
    pub async fn connect(config: KinesisSupplierConfig, client: Option<Client>) -> Result<Self> {
        let client = match client {
            Some(client) => client,
            None => Self::make_client(&config).await,
        };
        let (buffer_tx, buffer_rx) = mpsc::channel(config.record_buffer_size.max(1));
        let fetch_gate = Arc::new(Semaphore::new(config.fetch_threads.max(1)));
        Ok(Self {
            client,
            config,
            shards: HashMap::new(),
            buffer_tx,
            buffer_rx,
            fetch_gate,
            consumed: HashMap::new(),
            closed: false,
        })
    }

    async fn make_client(config: &KinesisSupplierConfig) -> Client {
        let region_provider =
            RegionProviderChain::first_try(config.region.clone().map(Region::new))
                .or_default_provider()
                .or_else(Region::new("us-east-1"));

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
        if let Some(endpoint_url) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }
        Client::new(&loader.load().await)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed { Err(Error::Closed) } else { Ok(()) }
    }

    /// Replaces the working set. Newly assigned shards resume from their
    /// last consumed position if one is known, else the retention bound.
    pub async fn assign(&mut self, partitions: Vec<ShardPartition>) -> Result<()> {
        self.check_open()?;

        let keep: HashSet<ShardPartition> = partitions.iter().cloned().collect();
        let dropped: Vec<ShardPartition> = self
            .shards
            .keys()
            .filter(|sp| !keep.contains(sp))
            .cloned()
            .collect();
        for sp in dropped {
            if let Some(state) = self.shards.remove(&sp) {
                info!(partition = %sp, "Stopping fetcher for unassigned shard");
                state.cancel.cancel();
                if let Some(handle) = state.handle {
                    handle.abort();
                }
            }
        }

        for sp in partitions {
            if !self.shards.contains_key(&sp) {
                let resume = self
                    .consumed
                    .get(&sp)
                    .cloned()
                    .unwrap_or(ResumeFrom::TrimHorizon);
                self.shards.insert(sp, ShardState::new(resume));
            }
        }
        Ok(())
    }

    pub async fn seek(&mut self, partition: &ShardPartition, sequence_number: &str) -> Result<()> {
        self.check_open()?;
        self.set_resume(partition, ResumeFrom::AtSequence(sequence_number.to_string()))?;
        self.restart_fetchers(&HashSet::from([partition.clone()])).await;
        Ok(())
    }

    pub async fn seek_to_earliest(&mut self, partitions: &[ShardPartition]) -> Result<()> {
        self.check_open()?;
        for sp in partitions {
            self.set_resume(sp, ResumeFrom::TrimHorizon)?;
        }
        self.restart_fetchers(&partitions.iter().cloned().collect()).await;
        Ok(())
    }

    pub async fn seek_to_latest(&mut self, partitions: &[ShardPartition]) -> Result<()> {
        self.check_open()?;
        for sp in partitions {
            self.set_resume(sp, ResumeFrom::Latest)?;
        }
        self.restart_fetchers(&partitions.iter().cloned().collect()).await;
        Ok(())
    }

    fn set_resume(&mut self, partition: &ShardPartition, resume: ResumeFrom) -> Result<()> {
        let Some(state) = self.shards.get_mut(partition) else {
            return Err(Error::NotAssigned {
                stream: partition.stream.clone(),
                shard_id: partition.shard_id.clone(),
            });
        };
        *state.resume.lock().expect("resume lock") = resume;
        Ok(())
    }

    pub fn assignment(&self) -> Vec<ShardPartition> {
        self.shards.keys().cloned().collect()
    }

    /// Drains up to `min(max(buffered, 1), max_records_per_poll)` records
    /// within `timeout`, dropping anything for shards that are no longer
    /// assigned.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Vec<KinesisRecord>> {
        self.check_open()?;
        self.start_fetchers();

        let limit = self
            .buffer_rx
            .len()
            .max(1)
            .min(self.config.max_records_per_poll.max(1));

        let mut drained = Vec::with_capacity(limit);
        let _ = tokio::time::timeout(timeout, self.buffer_rx.recv_many(&mut drained, limit)).await;

        let mut records = Vec::with_capacity(drained.len());
        for record in drained {
            let partition = record.partition();
            if !self.shards.contains_key(&partition) {
                debug!(partition = %partition, "Dropping buffered record for unassigned shard");
                continue;
            }
            let consumed = match &record.sequence_number {
                Some(seq) => ResumeFrom::AfterSequence(seq.clone()),
                None => ResumeFrom::ShardClosed,
            };
            self.consumed.insert(partition, consumed);
            records.push(record);
        }
        Ok(records)
    }

    pub async fn earliest_sequence_number(
        &self,
        partition: &ShardPartition,
    ) -> Result<SequenceProbe> {
        self.check_open()?;
        self.sequence_probe(partition, ShardIteratorType::TrimHorizon).await
    }

    pub async fn latest_sequence_number(
        &self,
        partition: &ShardPartition,
    ) -> Result<SequenceProbe> {
        self.check_open()?;
        self.sequence_probe(partition, ShardIteratorType::Latest).await
    }

    pub async fn partition_ids(&self, stream: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let output = self
            .client
            .list_shards()
            .stream_name(stream)
            .send()
            .await
            .map_err(|e| {
                if matches!(e.as_service_error(), Some(se) if se.is_resource_not_found_exception())
                {
                    Error::StreamNotFound(stream.to_string())
                } else {
                    Error::Kinesis(format!("Failed to list shards for {stream}: {e}"))
                }
            })?;
        Ok(output
            .shards()
            .iter()
            .map(|shard| shard.shard_id().to_string())
            .collect())
    }

    /// Idempotent. Joins fetchers within a bounded deadline, aborting any
    /// that do not stop in time.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let handles: Vec<JoinHandle<()>> = self
            .shards
            .values_mut()
            .filter_map(|state| {
                state.cancel.cancel();
                state.handle.take()
            })
            .collect();
        for mut handle in handles {
            if tokio::time::timeout(EXCEPTION_RETRY_DELAY, &mut handle).await.is_err() {
                warn!("Fetcher did not stop before deadline while closing supplier, aborting");
                handle.abort();
            }
        }
        self.shards.clear();
    }

    fn start_fetchers(&mut self) {
        for (partition, state) in &mut self.shards {
            if state.started {
                continue;
            }
            info!(partition = %partition, "Starting fetcher for shard");
            state.started = true;
            state.cancel = CancellationToken::new();
            state.handle = Some(tokio::spawn(run_fetcher(
                self.client.clone(),
                partition.clone(),
                Arc::clone(&state.resume),
                self.buffer_tx.clone(),
                Arc::clone(&self.fetch_gate),
                state.cancel.clone(),
                self.config.clone(),
            )));
        }
    }

    /// Stops every fetcher, drops buffered records belonging to `targeted`
    /// shards, and leaves all shards ready for the next poll to restart.
    async fn restart_fetchers(&mut self, targeted: &HashSet<ShardPartition>) {
        for state in self.shards.values_mut() {
            state.cancel.cancel();
            state.started = false;
        }
        let handles: Vec<JoinHandle<()>> = self
            .shards
            .values_mut()
            .filter_map(|state| state.handle.take())
            .collect();
        for mut handle in handles {
            if tokio::time::timeout(EXCEPTION_RETRY_DELAY, &mut handle).await.is_err() {
                warn!("Fetcher did not stop before deadline while restarting, aborting");
                handle.abort();
            }
        }

        // retain buffered records for shards that were not seeked
        let (new_tx, new_rx) = mpsc::channel(self.config.record_buffer_size.max(1));
        while let Ok(record) = self.buffer_rx.try_recv() {
            if !targeted.contains(&record.partition()) && new_tx.try_send(record).is_err() {
                break;
            }
        }
        self.buffer_tx = new_tx;
        self.buffer_rx = new_rx;
    }

    async fn sequence_probe(
        &self,
        partition: &ShardPartition,
        iterator_type: ShardIteratorType,
    ) -> Result<SequenceProbe> {
        let deadline = Instant::now() + self.config.sequence_probe_timeout();

        let mut iterator = self
            .get_iterator(partition, iterator_type, None)
            .await?;

        while let Some(it) = iterator {
            if Instant::now() >= deadline {
                warn!(
                    partition = %partition,
                    "Timed out fetching a sequence number, likely no more records in shard"
                );
                return Ok(SequenceProbe::TimedOut);
            }

            let result = self
                .client
                .get_records()
                .shard_iterator(&it)
                .limit(1000)
                .send()
                .await;

            match result {
                Ok(output) => {
                    if let Some(first) = output.records().first() {
                        return Ok(SequenceProbe::At(first.sequence_number().to_string()));
                    }
                    iterator = output.next_shard_iterator().map(ToString::to_string);
                }
                Err(e) if is_throughput_exceeded(&e) => {
                    tokio::time::sleep(THROUGHPUT_BACKOFF).await;
                    iterator = Some(it);
                }
                Err(e) => {
                    return Err(Error::Kinesis(format!(
                        "Failed to fetch sequence number for {partition}: {e}"
                    )));
                }
            }
        }

        info!(partition = %partition, "Shard iterator exhausted, shard is closed");
        Ok(SequenceProbe::ShardClosed)
    }

    async fn get_iterator(
        &self,
        partition: &ShardPartition,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
    ) -> Result<Option<String>> {
        let mut request = self
            .client
            .get_shard_iterator()
            .stream_name(&partition.stream)
            .shard_id(&partition.shard_id)
            .shard_iterator_type(iterator_type);
        if let Some(seq) = sequence_number {
            request = request.starting_sequence_number(seq);
        }
        let output = request.send().await.map_err(|e| {
            Error::Kinesis(format!("Failed to get shard iterator for {partition}: {e}"))
        })?;
        Ok(output.shard_iterator().map(ToString::to_string))
    }
}

async fn resolve_iterator(
    client: &Client,
    partition: &ShardPartition,
    resume: &ResumeFrom,
) -> Result<Option<String>> {
    let (iterator_type, sequence) = match resume {
        ResumeFrom::AtSequence(seq) => (ShardIteratorType::AtSequenceNumber, Some(seq.as_str())),
        ResumeFrom::AfterSequence(seq) => {
            (ShardIteratorType::AfterSequenceNumber, Some(seq.as_str()))
        }
        ResumeFrom::TrimHorizon => (ShardIteratorType::TrimHorizon, None),
        ResumeFrom::Latest => (ShardIteratorType::Latest, None),
        ResumeFrom::ShardClosed => return Ok(None),
    };

    let mut request = client
        .get_shard_iterator()
        .stream_name(&partition.stream)
        .shard_id(&partition.shard_id)
        .shard_iterator_type(iterator_type);
    if let Some(seq) = sequence {
        request = request.starting_sequence_number(seq);
    }
    let output = request.send().await.map_err(|e| {
        Error::Kinesis(format!("Failed to get shard iterator for {partition}: {e}"))
    })?;
    Ok(output.shard_iterator().map(ToString::to_string))
}

async fn run_fetcher(
    client: Client,
    partition: ShardPartition,
    resume: Arc<Mutex<ResumeFrom>>,
    buffer: mpsc::Sender<KinesisRecord>,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
    config: KinesisSupplierConfig,
) {
    macro_rules! sleep_or_stop {
        ($duration:expr) => {
            tokio::select! {
                _ = tokio::time::sleep($duration) => {},
                _ = cancel.cancelled() => return,
            }
        };
    }

    let mut iterator: Option<String> = None;
    let mut needs_resolve = true;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        if needs_resolve {
            let target = resume.lock().expect("resume lock").clone();
            match resolve_iterator(&client, &partition, &target).await {
                Ok(it) => {
                    iterator = it;
                    needs_resolve = false;
                }
                Err(e) => {
                    error!(partition = %partition, ?e, "Failed to resolve shard iterator, retrying");
                    sleep_or_stop!(EXCEPTION_RETRY_DELAY);
                    continue;
                }
            }
        }

        let Some(it) = iterator.clone() else {
            // shard is closed; surface one marker so the caller can retire it
            *resume.lock().expect("resume lock") = ResumeFrom::ShardClosed;
            debug!(partition = %partition, "Shard iterator closed, offering end-of-shard marker");
            let marker = KinesisRecord {
                stream: partition.stream.clone(),
                shard_id: partition.shard_id.clone(),
                sequence_number: None,
                data: Vec::new(),
            };
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                match buffer.send_timeout(marker.clone(), config.offer_timeout()).await {
                    Ok(()) => return,
                    Err(SendTimeoutError::Timeout(_)) => {
                        warn!(partition = %partition, "Record buffer full, retrying marker offer");
                        sleep_or_stop!(config.buffer_full_wait());
                    }
                    Err(SendTimeoutError::Closed(_)) => return,
                }
            }
        };

        let permit = tokio::select! {
            permit = gate.clone().acquire_owned() => permit.expect("fetch gate closed"),
            _ = cancel.cancelled() => return,
        };
        let result = client
            .get_records()
            .shard_iterator(&it)
            .limit(config.records_per_fetch)
            .send()
            .await;
        drop(permit);

        match result {
            Ok(output) => {
                let mut rewound = false;
                for kinesis_record in output.records() {
                    let sequence = kinesis_record.sequence_number().to_string();
                    let record = KinesisRecord {
                        stream: partition.stream.clone(),
                        shard_id: partition.shard_id.clone(),
                        sequence_number: Some(sequence.clone()),
                        data: vec![Bytes::from(kinesis_record.data().clone().into_inner())],
                    };

                    match buffer.send_timeout(record, config.offer_timeout()).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(_)) => {
                            // buffer full: rewind to the unoffered record and
                            // let the buffer drain before refetching
                            warn!(
                                partition = %partition,
                                "Record buffer full, rewinding iterator and backing off"
                            );
                            *resume.lock().expect("resume lock") =
                                ResumeFrom::AtSequence(sequence);
                            needs_resolve = true;
                            rewound = true;
                            break;
                        }
                        Err(SendTimeoutError::Closed(_)) => return,
                    }

                    *resume.lock().expect("resume lock") = ResumeFrom::AfterSequence(sequence);
                }

                if rewound {
                    sleep_or_stop!(config.buffer_full_wait());
                } else {
                    // None once the shard has been closed
                    iterator = output.next_shard_iterator().map(ToString::to_string);
                    sleep_or_stop!(config.fetch_delay());
                }
            }
            Err(e) if is_throughput_exceeded(&e) => {
                let wait = THROUGHPUT_BACKOFF.max(config.fetch_delay());
                debug!(partition = %partition, "Throughput limit hit, backing off {wait:?}");
                sleep_or_stop!(wait);
            }
            Err(e) => {
                error!(partition = %partition, ?e, "Fetch failed, retrying after backoff");
                sleep_or_stop!(EXCEPTION_RETRY_DELAY);
            }
        }
    }
}

fn is_throughput_exceeded(err: &SdkError<GetRecordsError>) -> bool {
    matches!(
        err.as_service_error(),
        Some(e) if e.is_provisioned_throughput_exceeded_exception()
    )
}
