//! Task run storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database with the full event log
//!
//! The store is fed by a wildcard bus subscriber (see [`spawn_recorder`]),
//! so it never sits on the orchestration path.

mod memory;
mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bus::{MessageBus, Topic};
use crate::progress::{EventStatus, ProgressEvent};
use crate::task::{Decision, OutputKind, TaskId, TaskStatus};

/// One row per task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: TaskId,
    pub description: String,
    pub output_kind: OutputKind,
    pub status: TaskStatus,
    pub progress_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

impl TaskRun {
    pub fn new(task_id: TaskId, description: impl Into<String>, output_kind: OutputKind) -> Self {
        let now = now_string();
        Self {
            task_id,
            description: description.into(),
            output_kind,
            status: TaskStatus::Pending,
            progress_percent: 0.0,
            current_step: None,
            started_at: now.clone(),
            updated_at: now,
            ended_at: None,
            decision: None,
        }
    }

    /// Fold one event into the row.
    pub fn apply(&mut self, event: &ProgressEvent) {
        if let Some(status) = status_for(event.status) {
            self.status = status;
        }
        self.progress_percent = event.progress_percent;
        if let Some(step) = &event.step {
            self.current_step = Some(step.tool.clone());
        } else if !event.status.is_terminal() {
            self.current_step = Some(event.stage.clone());
        }
        if event.decision.is_some() {
            self.decision = event.decision.clone();
        }
        let timestamp = event.timestamp.to_rfc3339();
        if event.status.is_terminal() {
            self.ended_at = Some(timestamp.clone());
        }
        self.updated_at = timestamp;
    }
}

/// Task status an event implies; `None` for markers that leave it as is.
fn status_for(status: EventStatus) -> Option<TaskStatus> {
    match status {
        EventStatus::Pending => Some(TaskStatus::Pending),
        EventStatus::Planning => Some(TaskStatus::Planning),
        EventStatus::Executing | EventStatus::StepCompleted | EventStatus::FailedStep => {
            Some(TaskStatus::Executing)
        }
        EventStatus::Observing => Some(TaskStatus::Observing),
        EventStatus::Finalizing => Some(TaskStatus::Finalizing),
        EventStatus::Completed => Some(TaskStatus::Completed),
        EventStatus::Failed => Some(TaskStatus::Failed),
        EventStatus::Cancelled => Some(TaskStatus::Cancelled),
        EventStatus::Stalled => None,
    }
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    async fn create_run(&self, run: TaskRun) -> Result<(), String>;

    /// Append `event` and update the run it belongs to. Events for unknown
    /// runs are still appended.
    async fn apply_event(&self, event: &ProgressEvent) -> Result<(), String>;

    async fn get_run(&self, task_id: TaskId) -> Result<Option<TaskRun>, String>;

    /// Most recently started first.
    async fn list_runs(&self, limit: usize, offset: usize) -> Result<Vec<TaskRun>, String>;

    /// The stored event log of one task, in sequence order.
    async fn events(&self, task_id: TaskId) -> Result<Vec<ProgressEvent>, String>;
}

/// Feed every bus event into `store`. Returns the subscription id.
pub fn spawn_recorder(bus: &MessageBus, store: Arc<dyn TaskStore>) -> u64 {
    bus.subscribe_with(Topic::All, move |event| {
        let store = Arc::clone(&store);
        async move {
            if let Err(e) = store.apply_event(&event).await {
                tracing::warn!(
                    task_id = %event.task_id,
                    sequence = event.sequence,
                    "Failed to record event: {}",
                    e
                );
            }
        }
    })
}

/// Create a store by backend name (`memory` or `sqlite`).
pub async fn create_task_store(
    backend: &str,
    data_dir: std::path::PathBuf,
) -> Result<Arc<dyn TaskStore>, String> {
    match backend {
        "memory" => Ok(Arc::new(InMemoryTaskStore::new())),
        "sqlite" => Ok(Arc::new(
            SqliteTaskStore::new(data_dir.join("task_runs.db")).await?,
        )),
        other => Err(format!("Unknown task store backend: {}", other)),
    }
}
