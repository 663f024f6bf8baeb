//! # autoreport-agent
//!
//! Agent orchestration engine that resolves report template placeholders
//! against live data sources.
//!
//! This library provides:
//! - A bounded Plan -> Tool -> Observe -> Finalize loop per task
//! - Context assembly from schema, placeholder and schedule providers
//! - Streaming progress events with stalled-call detection
//! - An HTTP API with SSE progress streams
//!
//! ## Architecture
//!
//! ```text
//!   submit_task ──► ContextBuilder ──► Planner ──► StepExecutor ──► Finalizer
//!                                         ▲             │                │
//!                                         └── next round┘                ▼
//!                                                                    Decision
//!        ProgressTracker ──► MessageBus ──► subscribers (SSE, TaskStore)
//!               ▲
//!          StallGuard
//! ```
//!
//! ## Task Flow
//! 1. Build a bounded `TaskContext` from the providers
//! 2. Ask the model for a step plan over the stage's tools
//! 3. Run the steps in order, folding outputs into the context
//! 4. Ask the model for a decision and re-validate it against the context
//!
//! ## Modules
//! - `orchestrator`: task table, worker pool, the PTOF pipeline
//! - `agents`: planner, step executor, finalizer
//! - `tools`: the tool trait, registry and built-in tools
//! - `context`: task context, builder and providers
//! - `progress`: progress events, tracker, stall guard
//! - `bus`: per-task and wildcard event fan-out
//! - `store`: task run persistence
//! - `llm`: model clients

pub mod agents;
pub mod api;
pub mod bus;
pub mod config;
pub mod context;
pub mod datasource;
pub mod llm;
pub mod orchestrator;
pub mod progress;
pub mod store;
pub mod task;
pub mod tools;
pub mod util;

pub use config::Config;
pub use orchestrator::{Orchestrator, OrchestratorConfig, TaskRequest};
