//! Model-driven stages of a task run.
//!
//! - [`Planner`] turns the context and the stage's tool catalog into an
//!   [`ExecutionPlan`](crate::task::ExecutionPlan)
//! - [`StepExecutor`] walks a plan and folds tool outputs into the context
//! - [`Finalizer`] produces the terminal [`Decision`](crate::task::Decision)
//!
//! Every model and tool call goes through the task's
//! [`StallGuard`](crate::progress::StallGuard).

mod error;
mod executor;
mod finalizer;
mod planner;

pub use error::AgentError;
pub use executor::{FatalFailure, StepExecutor, StepRun};
pub use finalizer::Finalizer;
pub(crate) use finalizer::partial_result;
pub use planner::Planner;
