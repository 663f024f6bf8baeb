//! Planner: asks the model for a step plan and parses it strictly.

use std::sync::Arc;

use crate::agents::AgentError;
use crate::context::TaskContext;
use crate::llm::Completer;
use crate::progress::{Interrupt, StallGuard};
use crate::task::ExecutionPlan;
use crate::tools::{Tool, ToolStage};

const SYSTEM_PROMPT: &str = r#"You plan tool calls for a reporting agent that fills one placeholder of a business report.

Reply with exactly one JSON object and nothing else:
{
  "thought": "how you will approach the task",
  "steps": [
    {"tool": "<tool name>", "reason": "why this call", "input": {}}
  ],
  "expected_outcome": "what the context should hold when the steps are done"
}

Rules:
- Use only tools from the list you are given; steps run in the order written.
- A tool can only run once the context fields it reads exist, either already or written by an earlier step.
- Prefer the shortest plan that produces the requested output."#;

/// Builds planning prompts and parses the replies.
#[derive(Debug, Clone)]
pub struct Planner {
    completer: Completer,
    max_steps: usize,
}

impl Planner {
    pub fn new(completer: Completer, max_steps: usize) -> Self {
        Self {
            completer,
            max_steps: max_steps.max(1),
        }
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// The user prompt for one planning attempt.
    ///
    /// Deterministic for a given context, tool list and error: `tools` is
    /// expected sorted by name, as [`ToolRegistry::for_stage`] returns it.
    ///
    /// [`ToolRegistry::for_stage`]: crate::tools::ToolRegistry::for_stage
    pub fn build_prompt(
        &self,
        ctx: &TaskContext,
        tools: &[Arc<dyn Tool>],
        stage: ToolStage,
        previous_error: Option<&str>,
    ) -> String {
        let mut prompt = ctx.describe();

        prompt.push_str("\n\nSchema:\n");
        if ctx.schema.is_empty() {
            prompt.push_str("(no schema available)\n");
        } else {
            prompt.push_str(&ctx.schema.render());
        }

        prompt.push_str("\nAlready in context:");
        let mut any = false;
        if let Some(sql) = &ctx.current_sql {
            prompt.push_str(&format!("\n- current_sql: {}", sql));
            any = true;
        }
        if let Some(rows) = ctx.row_count() {
            prompt.push_str(&format!("\n- execution_result: {} row(s)", rows));
            any = true;
        }
        if ctx.chart_spec.is_some() {
            prompt.push_str("\n- chart_spec");
            any = true;
        }
        if ctx.report_text.is_some() {
            prompt.push_str("\n- report_text");
            any = true;
        }
        if !any {
            prompt.push_str(" nothing yet");
        }

        prompt.push_str(&format!("\n\nStage: {}\nAvailable tools:\n", stage));
        for tool in tools {
            let reads: Vec<&str> = tool.reads().iter().map(|f| f.as_str()).collect();
            let writes: Vec<&str> = tool.writes().iter().map(|f| f.as_str()).collect();
            prompt.push_str(&format!(
                "- {}: {} (reads: {}; writes: {}; input: {})\n",
                tool.name(),
                tool.description(),
                reads.join(", "),
                writes.join(", "),
                tool.parameters_schema()
            ));
        }
        prompt.push_str(&format!("\nUse at most {} steps.", self.max_steps));

        if let Some(error) = previous_error {
            prompt.push_str(&format!(
                "\n\nYour previous plan was rejected: {}\n\
                 Reply with the JSON object only. Every step needs `tool` and `reason`, \
                 and `tool` must be one of the names listed above.",
                error
            ));
        }
        prompt
    }

    /// Request and parse one plan.
    ///
    /// `previous_error` switches to the strict prompt.
    ///
    /// # Errors
    /// - `Cancelled` when the task token fires
    /// - `StallTimeout` when the stall detector abandons the model call
    /// - `Llm` when the model call fails
    /// - `PlanParse` when the reply is not a valid plan for `stage`
    pub async fn plan(
        &self,
        ctx: &TaskContext,
        tools: &[Arc<dyn Tool>],
        stage: ToolStage,
        previous_error: Option<&str>,
        guard: &StallGuard,
    ) -> Result<ExecutionPlan, AgentError> {
        let prompt = self.build_prompt(ctx, tools, stage, previous_error);
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();

        let reply = guard
            .run_with("planner", |_token| {
                self.completer.complete(Some(SYSTEM_PROMPT), &prompt)
            })
            .await
            .map_err(|interrupt| match interrupt {
                Interrupt::Cancelled => AgentError::Cancelled,
                Interrupt::Stalled => AgentError::StallTimeout {
                    label: "planner".to_string(),
                    threshold: guard.threshold(),
                },
            })?
            .map_err(|e| AgentError::Llm(format!("{:#}", e)))?;

        let plan = ExecutionPlan::parse(&reply, &names, self.max_steps)?;
        tracing::debug!(
            stage = %stage,
            steps = plan.steps.len(),
            tools = ?plan.tool_names(),
            "Parsed execution plan"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::context::fixtures::orders_context;
    use crate::llm::scripted::ScriptedLlm;
    use crate::progress::ProgressTracker;
    use crate::task::{OutputKind, PlanError, TaskId};
    use crate::tools::testing::{Behavior, FakeTool};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn tools() -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(FakeTool::new("sql.draft", Behavior::Output(json!({})))),
            Arc::new(FakeTool::new("sql.validate", Behavior::Output(json!({})))),
        ]
    }

    fn guard() -> StallGuard {
        let tracker = ProgressTracker::new(MessageBus::new());
        StallGuard::spawn(
            tracker.for_task(TaskId::new()),
            Duration::from_secs(30),
            CancellationToken::new(),
        )
    }

    #[test]
    fn prompt_is_deterministic_and_strict_mode_adds_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let planner = Planner::new(Completer::new(llm, "m"), 4);
        let ctx = orders_context(OutputKind::Sql);
        let tools = tools();

        let a = planner.build_prompt(&ctx, &tools, ToolStage::TaskExecution, None);
        let b = planner.build_prompt(&ctx, &tools, ToolStage::TaskExecution, None);
        assert_eq!(a, b);
        assert!(a.contains("- orders(id, amount, created_at)"));
        assert!(a.contains("- sql.draft:"));
        assert!(a.contains("at most 4 steps"));

        let strict = planner.build_prompt(&ctx, &tools, ToolStage::TaskExecution, Some("plan has no steps"));
        assert!(strict.contains("previous plan was rejected: plan has no steps"));
    }

    #[tokio::test]
    async fn parses_valid_plan() {
        let reply = r#"{"thought": "draft then check",
            "steps": [{"tool": "sql.draft", "reason": "write it"},
                      {"tool": "sql.validate", "reason": "check it"}],
            "expected_outcome": "valid SQL"}"#;
        let llm = Arc::new(ScriptedLlm::new(vec![reply.to_string()]));
        let planner = Planner::new(Completer::new(llm, "m"), 8);

        let plan = planner
            .plan(
                &orders_context(OutputKind::Sql),
                &tools(),
                ToolStage::TaskExecution,
                None,
                &guard(),
            )
            .await
            .expect("plan");
        assert_eq!(plan.tool_names(), vec!["sql.draft", "sql.validate"]);
    }

    #[tokio::test]
    async fn unadvertised_tool_is_a_parse_error() {
        let reply = r#"{"thought": "t", "steps": [{"tool": "chart.build", "reason": "r"}],
            "expected_outcome": "o"}"#;
        let llm = Arc::new(ScriptedLlm::new(vec![reply.to_string()]));
        let planner = Planner::new(Completer::new(llm, "m"), 8);

        let err = planner
            .plan(
                &orders_context(OutputKind::Sql),
                &tools(),
                ToolStage::TaskExecution,
                None,
                &guard(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::PlanParse(PlanError::UnknownTool { index: 0, .. })
        ));
        assert!(err.to_string().starts_with("PlanParseError:"));
    }
}
