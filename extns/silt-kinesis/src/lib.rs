//! Opaque-sequence stream client. Shards are read ahead by background
//! fetchers into a bounded buffer; `poll` only drains that buffer, so slow
//! consumers apply backpressure to the fetchers, never the other way around.

use std::time::Duration;

use serde::Deserialize;

pub use crate::supplier::{KinesisRecord, KinesisSupplier, SequenceProbe, ShardPartition};

pub mod supplier;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Kinesis - {0}")]
    Kinesis(String),

    #[error("Stream {0} not found")]
    StreamNotFound(String),

    #[error("Shard {stream}/{shard_id} is not assigned")]
    NotAssigned { stream: String, shard_id: String },

    #[error("Supplier has already been closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

const DEFAULT_RECORDS_PER_FETCH: i32 = 4000;
const DEFAULT_FETCH_DELAY_MS: u64 = 0;
const DEFAULT_FETCH_THREADS: usize = 2;
const DEFAULT_RECORD_BUFFER_SIZE: usize = 10_000;
const DEFAULT_RECORD_BUFFER_OFFER_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RECORD_BUFFER_FULL_WAIT_MS: u64 = 5_000;
const DEFAULT_FETCH_SEQUENCE_NUMBER_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_MAX_RECORDS_PER_POLL: usize = 100;

/// Fixed backoff applied when the stream reports a throughput limit; the
/// effective wait is `max(this, fetch_delay)`.
pub(crate) const THROUGHPUT_BACKOFF: Duration = Duration::from_millis(3_000);

/// Fixed backoff applied after any other fetcher failure.
pub(crate) const EXCEPTION_RETRY_DELAY: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KinesisSupplierConfig {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    /// Upper bound on records requested per GetRecords call.
    pub records_per_fetch: i32,
    pub fetch_delay_millis: u64,
    /// Concurrent GetRecords calls across all shards.
    pub fetch_threads: usize,
    /// Capacity of the shared record buffer.
    pub record_buffer_size: usize,
    pub record_buffer_offer_timeout_millis: u64,
    pub record_buffer_full_wait_millis: u64,
    /// How long a sequence-number probe keeps walking an empty shard before
    /// giving up.
    pub fetch_sequence_number_timeout_millis: u64,
    pub max_records_per_poll: usize,
}

impl Default for KinesisSupplierConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint_url: None,
            records_per_fetch: DEFAULT_RECORDS_PER_FETCH,
            fetch_delay_millis: DEFAULT_FETCH_DELAY_MS,
            fetch_threads: DEFAULT_FETCH_THREADS,
            record_buffer_size: DEFAULT_RECORD_BUFFER_SIZE,
            record_buffer_offer_timeout_millis: DEFAULT_RECORD_BUFFER_OFFER_TIMEOUT_MS,
            record_buffer_full_wait_millis: DEFAULT_RECORD_BUFFER_FULL_WAIT_MS,
            fetch_sequence_number_timeout_millis: DEFAULT_FETCH_SEQUENCE_NUMBER_TIMEOUT_MS,
            max_records_per_poll: DEFAULT_MAX_RECORDS_PER_POLL,
        }
    }
}

impl KinesisSupplierConfig {
    pub(crate) fn fetch_delay(&self) -> Duration {
        Duration::from_millis(self.fetch_delay_millis)
    }

    pub(crate) fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.record_buffer_offer_timeout_millis)
    }

    pub(crate) fn buffer_full_wait(&self) -> Duration {
        Duration::from_millis(self.record_buffer_full_wait_millis)
    }

    pub(crate) fn sequence_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_sequence_number_timeout_millis)
    }
}
