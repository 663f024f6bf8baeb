//! Step executor: walks one plan, folding tool outputs into the context.

use std::sync::Arc;

use crate::agents::AgentError;
use crate::context::TaskContext;
use crate::progress::{EventStatus, Interrupt, ProgressUpdate, StallGuard, StepRecord};
use crate::task::{ExecutionPlan, PlanStep};
use crate::tools::{ToolErrorKind, ToolRegistry, ToolResult, ToolStage};

/// A failed step whose tool is fatal for the task's output kind.
#[derive(Debug, Clone, PartialEq)]
pub struct FatalFailure {
    pub index: usize,
    pub tool: String,
    pub error: String,
}

/// Counters for one plan run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepRun {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Set when the loop stopped early on a fatal tool.
    pub fatal: Option<FatalFailure>,
}

/// Runs plan steps strictly in index order, one at a time.
///
/// # Invariants
/// - a step starts only after the previous one finished and was merged
/// - every finished step emits exactly one `step_completed` or
///   `failed_step` event carrying a [`StepRecord`]
pub struct StepExecutor {
    registry: Arc<ToolRegistry>,
    stall_retries: u32,
}

impl StepExecutor {
    pub fn new(registry: Arc<ToolRegistry>, stall_retries: u32) -> Self {
        Self {
            registry,
            stall_retries,
        }
    }

    /// Execute `plan` against `ctx`.
    ///
    /// Failed steps are recorded and skipped unless their tool is listed in
    /// `fatal_tools`, which stops the loop.
    ///
    /// # Errors
    /// - `Cancelled` when the task token fires mid-run
    /// - `ToolNotFound` when a step names an unregistered tool
    pub async fn run(
        &self,
        round: usize,
        stage: ToolStage,
        plan: &ExecutionPlan,
        ctx: &mut TaskContext,
        guard: &StallGuard,
        fatal_tools: &[String],
    ) -> Result<StepRun, AgentError> {
        let total = plan.steps.len();
        let mut run = StepRun::default();

        for (index, step) in plan.steps.iter().enumerate() {
            let tool = self
                .registry
                .get(&step.tool)
                .ok_or_else(|| AgentError::ToolNotFound(step.tool.clone()))?;

            guard.events().emit(
                ProgressUpdate::new(
                    EventStatus::Executing,
                    stage.as_str(),
                    format!("Step {}/{}: {} ({})", index + 1, total, step.tool, step.reason),
                )
                .with_current_step(step.tool.clone()),
            );

            let (mut result, attempt) = self.run_step(step, ctx, guard).await?;
            if result.success {
                if let Err(e) = ctx.merge(&result.output, tool.writes()) {
                    result = ToolResult::failed(ToolErrorKind::InvalidOutput, e.to_string());
                }
            }

            run.attempted += 1;
            let error = result.error.as_ref().map(|info| match info.kind {
                ToolErrorKind::StallTimeout => info.message.clone(),
                _ => AgentError::ToolExecution {
                    tool: step.tool.clone(),
                    message: info.to_string(),
                }
                .to_string(),
            });
            let record = StepRecord {
                round,
                index,
                tool: step.tool.clone(),
                attempt,
                success: result.success,
                error: error.clone(),
                current_sql: ctx.current_sql.clone(),
                row_count: ctx.row_count(),
                has_chart: ctx.chart_spec.is_some(),
            };
            let percent = (index + 1) as f64 / total as f64 * 100.0;

            match error {
                None => {
                    run.succeeded += 1;
                    guard.events().emit(
                        ProgressUpdate::new(
                            EventStatus::StepCompleted,
                            stage.as_str(),
                            format!("Step {}/{} completed: {}", index + 1, total, step.tool),
                        )
                        .with_percent(percent)
                        .with_step(record),
                    );
                }
                Some(error) => {
                    run.failed += 1;
                    tracing::warn!(
                        task_id = %guard.events().task_id(),
                        tool = %step.tool,
                        "Step failed: {}",
                        error
                    );
                    guard.events().emit(
                        ProgressUpdate::new(
                            EventStatus::FailedStep,
                            stage.as_str(),
                            format!("Step {}/{} failed: {}", index + 1, total, step.tool),
                        )
                        .with_percent(percent)
                        .with_error(error.clone())
                        .with_step(record),
                    );
                    if fatal_tools.iter().any(|t| t == &step.tool) {
                        run.fatal = Some(FatalFailure {
                            index,
                            tool: step.tool.clone(),
                            error,
                        });
                        break;
                    }
                }
            }
        }
        Ok(run)
    }

    /// One step with stall retries. Returns the result and the attempt
    /// number that produced it.
    async fn run_step(
        &self,
        step: &PlanStep,
        ctx: &TaskContext,
        guard: &StallGuard,
    ) -> Result<(ToolResult, u32), AgentError> {
        let mut attempt = 1;
        loop {
            let registry = &self.registry;
            let outcome = guard
                .run_with(&step.tool, |token| async move {
                    registry.execute(&step.tool, &step.input, ctx, &token).await
                })
                .await;

            match outcome {
                Ok(result) => {
                    let result = result?;
                    if result.error_kind() == Some(ToolErrorKind::Cancelled) && guard.is_cancelled() {
                        return Err(AgentError::Cancelled);
                    }
                    return Ok((result, attempt));
                }
                Err(Interrupt::Cancelled) => return Err(AgentError::Cancelled),
                Err(Interrupt::Stalled) if attempt <= self.stall_retries => {
                    tracing::info!(
                        tool = %step.tool,
                        attempt,
                        "Retrying stalled step"
                    );
                    attempt += 1;
                }
                Err(Interrupt::Stalled) => {
                    let error = AgentError::StallTimeout {
                        label: step.tool.clone(),
                        threshold: guard.threshold(),
                    };
                    return Ok((
                        ToolResult::failed(ToolErrorKind::StallTimeout, error.to_string()),
                        attempt,
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::context::fixtures::orders_context;
    use crate::context::ContextField;
    use crate::progress::ProgressTracker;
    use crate::task::{OutputKind, TaskId};
    use crate::tools::testing::{Behavior, FakeTool};
    use serde_json::{json, Map};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn plan(tools: &[&str]) -> ExecutionPlan {
        ExecutionPlan {
            thought: "t".to_string(),
            steps: tools
                .iter()
                .map(|t| PlanStep {
                    tool: t.to_string(),
                    reason: "r".to_string(),
                    input: Map::new(),
                })
                .collect(),
            expected_outcome: "o".to_string(),
        }
    }

    fn setup(tools: Vec<FakeTool>, threshold: Duration) -> (StepExecutor, StallGuard, CancellationToken) {
        let mut registry = ToolRegistry::empty();
        for tool in tools {
            registry.register(Arc::new(tool));
        }
        let tracker = ProgressTracker::new(MessageBus::new());
        let token = CancellationToken::new();
        let guard = StallGuard::spawn(tracker.for_task(TaskId::new()), threshold, token.clone());
        (StepExecutor::new(Arc::new(registry), 1), guard, token)
    }

    #[tokio::test]
    async fn completion_order_follows_plan_order() {
        let (executor, guard, _token) = setup(
            vec![
                FakeTool::new("a", Behavior::Slow(Duration::from_millis(40), json!({}))),
                FakeTool::new("b", Behavior::Output(json!({}))),
                FakeTool::new("c", Behavior::Slow(Duration::from_millis(10), json!({}))),
            ],
            Duration::from_secs(30),
        );
        let mut ctx = orders_context(OutputKind::Report);

        let run = executor
            .run(0, ToolStage::TaskExecution, &plan(&["a", "b", "c"]), &mut ctx, &guard, &[])
            .await
            .expect("run");
        assert_eq!(run.succeeded, 3);

        let obs = guard.events().observation();
        assert_eq!(obs.completion_log, vec!["a", "b", "c"]);
        let last = guard.events().tracker().last_event(guard.events().task_id()).expect("event");
        assert_eq!(last.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn non_fatal_failure_continues_and_fatal_stops() {
        let (executor, guard, _token) = setup(
            vec![
                FakeTool::new("sql.draft", Behavior::Output(json!({"current_sql": "SELECT 1"}))),
                FakeTool::new("sql.execute", Behavior::Fail("db down".to_string())),
                FakeTool::new("reasoning", Behavior::Output(json!({"report_text": "x"}))),
            ],
            Duration::from_secs(30),
        );

        let mut ctx = orders_context(OutputKind::Report);
        let run = executor
            .run(0, ToolStage::TaskExecution, &plan(&["sql.draft", "sql.execute", "reasoning"]), &mut ctx, &guard, &[])
            .await
            .expect("run");
        assert_eq!((run.attempted, run.failed, run.fatal.is_none()), (3, 1, true));

        let mut ctx = orders_context(OutputKind::Sql);
        let run = executor
            .run(
                1,
                ToolStage::TaskExecution,
                &plan(&["sql.draft", "sql.execute", "reasoning"]),
                &mut ctx,
                &guard,
                &["sql.execute".to_string()],
            )
            .await
            .expect("run");
        assert_eq!(run.attempted, 2);
        let fatal = run.fatal.expect("fatal");
        assert_eq!(fatal.tool, "sql.execute");
        assert!(fatal.error.starts_with("ToolExecutionError:"));
        assert_eq!(ctx.current_sql.as_deref(), Some("SELECT 1"));
    }

    #[tokio::test]
    async fn stalled_step_is_retried_then_succeeds() {
        let (executor, guard, _token) = setup(
            vec![FakeTool::new(
                "flaky",
                Behavior::HangTimes(1, json!({"current_sql": "SELECT 2"})),
            )],
            Duration::from_millis(100),
        );
        let mut ctx = orders_context(OutputKind::Sql);

        let run = tokio::time::timeout(
            Duration::from_secs(5),
            executor.run(0, ToolStage::TaskExecution, &plan(&["flaky"]), &mut ctx, &guard, &[]),
        )
        .await
        .expect("bounded")
        .expect("run");
        assert_eq!(run.succeeded, 1);
        assert_eq!(ctx.current_sql.as_deref(), Some("SELECT 2"));

        let obs = guard.events().observation();
        assert_eq!(obs.stall_count, 1);
        let events = guard.events().tracker().events(guard.events().task_id());
        let step = events.iter().rev().find_map(|e| e.step.clone()).expect("step");
        assert_eq!(step.attempt, 2);
    }

    #[tokio::test]
    async fn invalid_output_fails_the_step() {
        let (executor, guard, _token) = setup(
            vec![FakeTool::new("bad", Behavior::Output(json!({"execution_result": "nope"})))
                .with_writes(&[ContextField::ExecutionResult])],
            Duration::from_secs(30),
        );
        let mut ctx = orders_context(OutputKind::Report);
        let run = executor
            .run(0, ToolStage::TaskExecution, &plan(&["bad"]), &mut ctx, &guard, &[])
            .await
            .expect("run");
        assert_eq!(run.failed, 1);
        assert!(ctx.execution_result.is_none());
    }

    #[tokio::test]
    async fn unknown_tool_and_cancellation_abort_the_run() {
        let (executor, guard, token) = setup(
            vec![FakeTool::new("hang", Behavior::Hang)],
            Duration::from_secs(30),
        );
        let mut ctx = orders_context(OutputKind::Report);
        let err = executor
            .run(0, ToolStage::TaskExecution, &plan(&["missing"]), &mut ctx, &guard, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolNotFound(_)));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let err = executor
            .run(0, ToolStage::TaskExecution, &plan(&["hang"]), &mut ctx, &guard, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn step_events_carry_the_round_stage() {
        let (executor, guard, _token) = setup(
            vec![FakeTool::new("chart.render", Behavior::Output(json!({})))],
            Duration::from_secs(30),
        );
        let mut ctx = orders_context(OutputKind::Chart);
        executor
            .run(1, ToolStage::ChartGeneration, &plan(&["chart.render"]), &mut ctx, &guard, &[])
            .await
            .expect("run");

        let events = guard.events().tracker().events(guard.events().task_id());
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.stage == "chart_generation"));
    }
}
