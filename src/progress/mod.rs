//! Progress events, the per-task event log, and stall (ANR) detection.
//!
//! Every observable change of a task is a [`ProgressEvent`] appended to that
//! task's log and published on the [`MessageBus`](crate::bus::MessageBus).
//! The last event is the task's observable state; the [`Observation`] handed
//! to the finalizer is folded from the log alone.

mod observation;
mod stall;
mod tracker;

pub use observation::Observation;
pub use stall::{Interrupt, StallGuard};
pub use tracker::{ProgressTracker, TaskEvents};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{Decision, TaskId, TaskStatus};

/// Status carried by one event.
///
/// Mirrors [`TaskStatus`] plus the per-step and stall markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Planning,
    Executing,
    StepCompleted,
    FailedStep,
    Observing,
    Finalizing,
    Stalled,
    Completed,
    Failed,
    Cancelled,
}

impl EventStatus {
    /// Terminal events close the log; later emissions are dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Planning => "planning",
            EventStatus::Executing => "executing",
            EventStatus::StepCompleted => "step_completed",
            EventStatus::FailedStep => "failed_step",
            EventStatus::Observing => "observing",
            EventStatus::Finalizing => "finalizing",
            EventStatus::Stalled => "stalled",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Cancelled => "cancelled",
        }
    }
}

impl From<TaskStatus> for EventStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => EventStatus::Pending,
            TaskStatus::Planning => EventStatus::Planning,
            TaskStatus::Executing => EventStatus::Executing,
            TaskStatus::Observing => EventStatus::Observing,
            TaskStatus::Finalizing => EventStatus::Finalizing,
            TaskStatus::Completed => EventStatus::Completed,
            TaskStatus::Failed => EventStatus::Failed,
            TaskStatus::Cancelled => EventStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one executed step, enough to rebuild an [`Observation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Planning round the step belongs to (0-based).
    pub round: usize,
    /// Position in that round's plan.
    pub index: usize,
    pub tool: String,
    /// 1 for the first try, incremented by stall retries.
    pub attempt: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(default)]
    pub has_chart: bool,
}

/// One entry of a task's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    /// Strictly increasing per task, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub progress_percent: f64,
    pub stage: String,
    pub message: String,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

impl ProgressEvent {
    pub(crate) fn from_update(
        task_id: TaskId,
        sequence: u64,
        progress_percent: f64,
        update: ProgressUpdate,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            sequence,
            timestamp,
            progress_percent,
            stage: update.stage,
            message: update.message,
            status: update.status,
            error: update.error,
            step: update.step,
            decision: update.decision,
        }
    }
}

/// An event before the tracker stamps it with sequence and time.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub status: EventStatus,
    pub stage: String,
    pub message: String,
    /// `None` keeps the task's last reported percent.
    pub progress_percent: Option<f64>,
    pub error: Option<String>,
    pub step: Option<StepRecord>,
    pub decision: Option<Decision>,
    /// Replaces the task's current step label when set.
    pub current_step: Option<String>,
}

impl ProgressUpdate {
    pub fn new(status: EventStatus, stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            stage: stage.into(),
            message: message.into(),
            progress_percent: None,
            error: None,
            step: None,
            decision: None,
            current_step: None,
        }
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.progress_percent = Some(percent.clamp(0.0, 100.0));
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_step(mut self, step: StepRecord) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_current_step(mut self, label: impl Into<String>) -> Self {
        self.current_step = Some(label.into());
        self
    }
}
