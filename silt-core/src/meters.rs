//! Row-level ingestion counters and the bounded buffer of recent parse
//! failures surfaced over the task HTTP endpoints and in the completion
//! report.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct RowMeters {
    processed: AtomicU64,
    processed_with_error: AtomicU64,
    unparseable: AtomicU64,
    thrown_away: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowStats {
    pub processed: u64,
    pub processed_with_error: u64,
    pub unparseable: u64,
    pub thrown_away: u64,
}

impl RowMeters {
    pub fn incr_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_processed_with_error(&self) {
        self.processed_with_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_unparseable(&self) {
        self.unparseable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_thrown_away(&self) {
        self.thrown_away.fetch_add(1, Ordering::Relaxed);
    }

    /// Total rows that failed parsing, fully or partially. Compared against
    /// the configured parse-exception budget.
    pub fn parse_failures(&self) -> u64 {
        self.unparseable.load(Ordering::Relaxed) + self.processed_with_error.load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> RowStats {
        RowStats {
            processed: self.processed.load(Ordering::Relaxed),
            processed_with_error: self.processed_with_error.load(Ordering::Relaxed),
            unparseable: self.unparseable.load(Ordering::Relaxed),
            thrown_away: self.thrown_away.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the most recent parse-failure messages, dropping the oldest once
/// the configured capacity is reached. Capacity 0 keeps nothing.
#[derive(Debug)]
pub struct SavedParseFailures {
    capacity: usize,
    messages: Mutex<VecDeque<String>>,
}

impl SavedParseFailures {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, message: String) {
        if self.capacity == 0 {
            return;
        }
        let mut messages = self.messages.lock().expect("parse failure buffer lock");
        if messages.len() == self.capacity {
            messages.pop_front();
        }
        messages.push_back(message);
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .expect("parse failure buffer lock")
            .iter()
            .cloned()
            .collect()
    }
}
