//! Core task record and its lifecycle state machine.
//!
//! # Invariants
//! - `id` is unique within one orchestrator
//! - `status` only changes through [`Task::advance`] / [`Task::finish`] /
//!   [`Task::cancel`], which reject illegal transitions
//! - once terminal, a task never changes again and holds exactly one outcome
//!   (a `Decision`, or none when cancelled)

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decision::Decision;

/// Unique identifier for a task.
///
/// # Properties
/// - Globally unique within an execution context
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a task is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Sql,
    Chart,
    Report,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Sql => "sql",
            OutputKind::Chart => "chart",
            OutputKind::Report => "report",
        }
    }

    /// Whether this kind needs a non-empty schema to be meaningful.
    pub fn needs_schema(&self) -> bool {
        matches!(self, OutputKind::Sql | OutputKind::Chart)
    }
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" => Ok(OutputKind::Sql),
            "chart" => Ok(OutputKind::Chart),
            "report" => Ok(OutputKind::Report),
            other => Err(TaskError::UnknownOutputKind(other.to_string())),
        }
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Planning -> Executing -> Observing -> Finalizing -> Completed
///    |          |           |  ^          |             \-> Failed
///    |          |           \--/          \-> Planning (next stage round)
///    |          \-> Failed  \-> Failed
///    \-> Failed (context build)
///
/// any non-terminal state -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    Observing,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Planning => "PLANNING",
            TaskStatus::Executing => "EXECUTING",
            TaskStatus::Observing => "OBSERVING",
            TaskStatus::Finalizing => "FINALIZING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    /// Check if the task is in a terminal state.
    ///
    /// # Property
    /// `is_terminal() => !can_transition_to(x)` for every `x`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check if the task is still active (can make progress).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Planning)
                | (Pending, Failed)
                | (Planning, Executing)
                | (Planning, Failed)
                | (Executing, Executing)
                | (Executing, Observing)
                | (Executing, Failed)
                | (Observing, Finalizing)
                | (Observing, Planning)
                | (Observing, Failed)
                | (Finalizing, Completed)
                | (Finalizing, Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => TaskStatus::Pending,
            "PLANNING" => TaskStatus::Planning,
            "EXECUTING" => TaskStatus::Executing,
            "OBSERVING" => TaskStatus::Observing,
            "FINALIZING" => TaskStatus::Finalizing,
            "COMPLETED" => TaskStatus::Completed,
            "FAILED" => TaskStatus::Failed,
            "CANCELLED" => TaskStatus::Cancelled,
            other => return Err(TaskError::UnknownStatus(other.to_string())),
        };
        Ok(status)
    }
}

/// A submitted task as tracked by the orchestrator's task table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    description: String,
    output_kind: OutputKind,
    status: TaskStatus,
    decision: Option<Decision>,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task in `Pending` state.
    ///
    /// # Errors
    /// Returns `Err` if the description is blank.
    pub fn new(description: impl Into<String>, output_kind: OutputKind) -> Result<Self, TaskError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(TaskError::EmptyDescription);
        }

        Ok(Self {
            id: TaskId::new(),
            description,
            output_kind,
            status: TaskStatus::Pending,
            decision: None,
            created_at: Utc::now(),
            ended_at: None,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn output_kind(&self) -> OutputKind {
        self.output_kind
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Move to a non-terminal state.
    ///
    /// # Errors
    /// Returns `InvalidTransition` for illegal edges, including any attempt
    /// to leave a terminal state.
    pub fn advance(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if next.is_terminal() {
            return Err(self.invalid(next));
        }
        if !self.status.can_transition_to(next) {
            return Err(self.invalid(next));
        }
        self.status = next;
        Ok(())
    }

    /// Record the terminal decision. `success` maps to `Completed`,
    /// anything else to `Failed`.
    pub fn finish(&mut self, decision: Decision) -> Result<TaskStatus, TaskError> {
        let next = if decision.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        if !self.status.can_transition_to(next) {
            return Err(self.invalid(next));
        }
        self.status = next;
        self.decision = Some(decision);
        self.ended_at = Some(Utc::now());
        Ok(next)
    }

    /// Transition to `Cancelled`.
    ///
    /// # Precondition
    /// `self.status.is_active()`
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        if !self.status.can_transition_to(TaskStatus::Cancelled) {
            return Err(self.invalid(TaskStatus::Cancelled));
        }
        self.status = TaskStatus::Cancelled;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    fn invalid(&self, to: TaskStatus) -> TaskError {
        TaskError::InvalidTransition {
            from: self.status,
            to,
        }
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskError {
    #[error("Task description cannot be empty")]
    EmptyDescription,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Unknown output kind: {0}")]
    UnknownOutputKind(String),

    #[error("Unknown task status: {0}")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut task = Task::new("sum refunds", OutputKind::Sql).expect("task");
        assert_eq!(task.status(), TaskStatus::Pending);

        for next in [
            TaskStatus::Planning,
            TaskStatus::Executing,
            TaskStatus::Executing,
            TaskStatus::Observing,
            TaskStatus::Finalizing,
        ] {
            task.advance(next).expect("legal transition");
        }

        let status = task
            .finish(Decision::new(true, "SELECT 1", "ok", 0.9))
            .expect("finish");
        assert_eq!(status, TaskStatus::Completed);
        assert!(task.decision().is_some());
        assert!(task.ended_at().is_some());
    }

    #[test]
    fn failed_decision_maps_to_failed() {
        let mut task = Task::new("x", OutputKind::Report).expect("task");
        task.advance(TaskStatus::Planning).expect("planning");
        let status = task
            .finish(Decision::failure("plan parse failed"))
            .expect("planning may fail");
        assert_eq!(status, TaskStatus::Failed);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut task = Task::new("x", OutputKind::Sql).expect("task");
        let err = task.advance(TaskStatus::Finalizing).unwrap_err();
        assert_eq!(
            err,
            TaskError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Finalizing
            }
        );

        // Success cannot be recorded straight from Executing.
        task.advance(TaskStatus::Planning).expect("planning");
        task.advance(TaskStatus::Executing).expect("executing");
        assert!(task.finish(Decision::new(true, "", "", 1.0)).is_err());
        assert_eq!(task.status(), TaskStatus::Executing);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut task = Task::new("x", OutputKind::Chart).expect("task");
        task.cancel().expect("cancel pending");
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(task.cancel().is_err());
        assert!(task.advance(TaskStatus::Planning).is_err());
        assert!(task.finish(Decision::failure("late")).is_err());
        assert!(task.decision().is_none());
    }

    #[test]
    fn observing_may_replan() {
        assert!(TaskStatus::Observing.can_transition_to(TaskStatus::Planning));
        assert!(!TaskStatus::Executing.can_transition_to(TaskStatus::Planning));
        assert!(!TaskStatus::Planning.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn observing_may_fail_directly() {
        let mut task = Task::new("x", OutputKind::Chart).expect("task");
        task.advance(TaskStatus::Planning).expect("planning");
        task.advance(TaskStatus::Executing).expect("executing");
        task.advance(TaskStatus::Observing).expect("observing");
        assert_eq!(task.finish(Decision::failure("boom")).expect("finish"), TaskStatus::Failed);
        assert!(!TaskStatus::Observing.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn empty_description_rejected() {
        assert_eq!(
            Task::new("   ", OutputKind::Sql).unwrap_err(),
            TaskError::EmptyDescription
        );
    }

    #[test]
    fn parse_round_trip_names() {
        assert_eq!("CHART".parse::<OutputKind>().expect("kind"), OutputKind::Chart);
        assert!("pdf".parse::<OutputKind>().is_err());
        assert_eq!(
            "observing".parse::<TaskStatus>().expect("status"),
            TaskStatus::Observing
        );
        let id = TaskId::new();
        assert_eq!(id.to_string().parse::<TaskId>().expect("id"), id);
    }
}
