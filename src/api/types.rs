//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::task::{TaskId, TaskStatus};

/// Response after creating a task.
#[derive(Debug, Clone, Serialize)]
pub struct CreateTaskResponse {
    /// Unique task identifier
    pub task_id: TaskId,

    /// Status at submission time (always `PENDING`)
    pub status: TaskStatus,
}

/// Response of a cancel request.
#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub task_id: TaskId,
    /// Whether the task is now cancelled
    pub cancelled: bool,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model: String,
    pub worker_count: usize,
    /// Whether task runs survive a restart
    pub persistent_store: bool,
}

/// Query parameters for listing runs.
#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}
