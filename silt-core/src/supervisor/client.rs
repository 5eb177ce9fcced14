//! Seams to the orchestrator: the chat client the supervisor uses to talk
//! to its child tasks, and the queue it submits them through. Production
//! wiring speaks HTTP to the task endpoints in [`crate::runner::http`];
//! tests connect runner handles directly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::config::task::TaskConfig;
use crate::runner::Status;
use crate::runner::sequences::OffsetMap;

/// Lifecycle state as the orchestrator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub state: TaskState,
}

/// Chat surface of one running task. Every call can fail transiently; the
/// supervisor wraps calls in its retry budget and treats an exhausted budget
/// as an unresponsive task. The methods return `Send` futures so they can be
/// driven from the supervisor's spawned notice loop.
pub trait TaskClient: Send + Sync + 'static {
    fn status(&self, task_id: &str) -> impl std::future::Future<Output = Result<Status>> + Send;

    fn start_time(
        &self,
        task_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    fn checkpoints(
        &self,
        task_id: &str,
    ) -> impl std::future::Future<Output = Result<BTreeMap<i32, OffsetMap>>> + Send;

    fn current_offsets(
        &self,
        task_id: &str,
    ) -> impl std::future::Future<Output = Result<OffsetMap>> + Send;

    /// Pauses the task and returns the offsets it parked at.
    fn pause(&self, task_id: &str)
        -> impl std::future::Future<Output = Result<OffsetMap>> + Send;

    fn resume(&self, task_id: &str) -> impl std::future::Future<Output = Result<()>> + Send;

    fn set_end_offsets(
        &self,
        task_id: &str,
        offsets: OffsetMap,
        finish: bool,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Graceful stop.
    fn stop(&self, task_id: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Task orchestration surface: submit, kill and enumerate tasks.
pub trait TaskQueue: Send + Sync + 'static {
    fn submit(&self, config: TaskConfig) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Hard kill; the task does not get to publish.
    fn shutdown(&self, task_id: &str) -> impl std::future::Future<Output = Result<()>> + Send;

    fn list(
        &self,
        datasource: &str,
    ) -> impl std::future::Future<Output = Result<Vec<TaskSummary>>> + Send;

    /// The submitted config of a known task, used for adoption checks.
    fn config(
        &self,
        task_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<TaskConfig>>> + Send;
}
