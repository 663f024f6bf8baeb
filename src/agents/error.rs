//! Error taxonomy of the orchestration pipeline.

use std::time::Duration;

use crate::context::ContextBuildError;
use crate::task::{PlanError, TaskError};

/// Errors that can occur while running a task.
///
/// Only `ContextBuild`, `PlanParse` (once attempts are exhausted),
/// `ToolNotFound` and fatal-tool failures end a task early; the rest are
/// recorded on the event log and tolerated.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("ContextBuildError: {0}")]
    ContextBuild(#[from] ContextBuildError),

    #[error("PlanParseError: {0}")]
    PlanParse(#[from] PlanError),

    #[error("ToolNotFoundError: no tool named `{0}`")]
    ToolNotFound(String),

    #[error("ToolExecutionError: {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("StallTimeoutError: no progress for {threshold:?} while running {label}")]
    StallTimeout { label: String, threshold: Duration },

    #[error("FinalizeValidationError: {0}")]
    FinalizeValidation(String),

    #[error("Model call failed: {0}")]
    Llm(String),

    #[error("Provider call failed: {0}")]
    Provider(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl AgentError {
    /// Whether a bounded retry may clear this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::PlanParse(_) | AgentError::Llm(_) | AgentError::StallTimeout { .. }
        )
    }
}
