//! Task module - defines tasks, their lifecycle, plans and decisions.
//!
//! - Invariants are documented and enforced in constructors
//! - Parsers for model output fail closed
//! - Pure functions are separated from IO operations

mod decision;
mod plan;
pub mod task;

pub use decision::{Decision, DecisionDraft, DecisionParseError};
pub use plan::{ExecutionPlan, PlanError, PlanStep};
pub use task::{OutputKind, Task, TaskError, TaskId, TaskStatus};
