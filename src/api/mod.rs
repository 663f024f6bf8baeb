//! HTTP API for the report agent.
//!
//! ## Endpoints
//!
//! - `POST /api/tasks` - Submit a new task
//! - `GET /api/tasks` - List tasks known to this process
//! - `GET /api/tasks/{id}` - Get task status and decision
//! - `POST /api/tasks/{id}/cancel` - Cancel a task
//! - `GET /api/tasks/{id}/events` - Stream task progress via SSE
//! - `GET /api/events` - Stream progress of every task via SSE
//! - `GET /api/runs` - List recorded task runs
//! - `GET /api/runs/{id}/events` - Recorded event log of a run
//! - `GET /api/tools` - List registered tools
//! - `GET /api/health` - Health check

mod routes;
pub mod types;

pub use routes::{app, build_state, serve, AppState};
pub use types::*;
