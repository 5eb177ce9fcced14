//! Segment driver used by tests and local runs: rows are counted, not
//! stored, and segment identifiers are synthesized per sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::{AddResult, CommitMetadata, InputRow, SegmentDriver};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct SequenceBuild {
    rows_in_active_segment: usize,
    segment_index: usize,
    segments: Vec<String>,
}

#[derive(Default)]
struct DriverInner {
    restored: Option<CommitMetadata>,
    builds: HashMap<String, SequenceBuild>,
    persisted: Vec<CommitMetadata>,
    published: Vec<String>,
    pending_handoffs: Vec<oneshot::Sender<()>>,
    closed: bool,
}

/// Shared inspection/override handle for tests.
#[derive(Clone, Default)]
pub struct DriverProbe {
    inner: Arc<Mutex<DriverInner>>,
    hold_handoffs: Arc<Mutex<bool>>,
}

impl DriverProbe {
    pub fn published_segments(&self) -> Vec<String> {
        self.inner.lock().expect("driver lock").published.clone()
    }

    pub fn persisted_commits(&self) -> Vec<CommitMetadata> {
        self.inner.lock().expect("driver lock").persisted.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("driver lock").closed
    }

    /// Make start_job report previously persisted state.
    pub fn set_restored(&self, commit: CommitMetadata) {
        self.inner.lock().expect("driver lock").restored = Some(commit);
    }

    /// When held, handoff receivers stay pending until
    /// [`DriverProbe::complete_handoffs`] runs.
    pub fn hold_handoffs(&self) {
        *self.hold_handoffs.lock().expect("handoff mode lock") = true;
    }

    pub fn complete_handoffs(&self) {
        let mut inner = self.inner.lock().expect("driver lock");
        for sender in inner.pending_handoffs.drain(..) {
            let _ = sender.send(());
        }
    }
}

pub struct InMemoryDriver {
    probe: DriverProbe,
    max_rows_per_segment: usize,
}

impl InMemoryDriver {
    pub fn new(max_rows_per_segment: usize) -> Self {
        Self {
            probe: DriverProbe::default(),
            max_rows_per_segment: max_rows_per_segment.max(1),
        }
    }

    pub fn probe(&self) -> DriverProbe {
        self.probe.clone()
    }

    fn check_open(inner: &DriverInner) -> Result<()> {
        if inner.closed {
            Err(Error::Driver("driver already closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl SegmentDriver for InMemoryDriver {
    async fn start_job(&mut self) -> Result<Option<CommitMetadata>> {
        let inner = self.probe.inner.lock().expect("driver lock");
        Self::check_open(&inner)?;
        Ok(inner.restored.clone())
    }

    async fn add(
        &mut self,
        _row: InputRow,
        sequence_name: &str,
        _skip_lineage_check: bool,
    ) -> Result<AddResult> {
        let mut inner = self.probe.inner.lock().expect("driver lock");
        Self::check_open(&inner)?;

        let build = inner.builds.entry(sequence_name.to_string()).or_default();
        if build.rows_in_active_segment == 0 {
            build
                .segments
                .push(format!("{sequence_name}_segment_{}", build.segment_index));
        }
        build.rows_in_active_segment += 1;

        let push_required = build.rows_in_active_segment >= self.max_rows_per_segment;
        if push_required {
            // roll the active segment
            build.rows_in_active_segment = 0;
            build.segment_index += 1;
        }

        Ok(AddResult {
            push_required,
            persist_required: false,
        })
    }

    async fn persist(&mut self, commit: CommitMetadata) -> Result<()> {
        let mut inner = self.probe.inner.lock().expect("driver lock");
        Self::check_open(&inner)?;
        inner.persisted.push(commit);
        Ok(())
    }

    async fn publish_segments(&mut self, sequence_names: &[String]) -> Result<Vec<String>> {
        let mut inner = self.probe.inner.lock().expect("driver lock");
        Self::check_open(&inner)?;
        let mut segments = Vec::new();
        for name in sequence_names {
            if let Some(build) = inner.builds.remove(name) {
                segments.extend(build.segments);
            }
        }
        inner.published.extend(segments.iter().cloned());
        Ok(segments)
    }

    async fn register_handoff(&mut self, _segments: Vec<String>) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        if *self.probe.hold_handoffs.lock().expect("handoff mode lock") {
            let mut inner = self.probe.inner.lock().expect("driver lock");
            inner.pending_handoffs.push(tx);
        } else {
            let _ = tx.send(());
        }
        Ok(rx)
    }

    async fn close(&mut self) -> Result<()> {
        self.probe.inner.lock().expect("driver lock").closed = true;
        Ok(())
    }
}
