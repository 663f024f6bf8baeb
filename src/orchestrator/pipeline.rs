//! One task run: context build, planning rounds, steps, finalization.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use super::{Inner, TaskRequest};
use crate::agents::{partial_result, AgentError};
use crate::context::{ContextBuildError, ContextInputs, Constraints, ContextField, TaskContext};
use crate::progress::{EventStatus, Interrupt, ProgressUpdate, StallGuard, TaskEvents};
use crate::task::{Decision, ExecutionPlan, OutputKind, TaskId, TaskStatus};
use crate::tools::ToolStage;
use crate::util::sanitize_name_list;

/// Planning rounds for an output kind: chart tasks get a chart round after
/// the query round.
fn stage_rounds(kind: OutputKind, requested: Option<ToolStage>) -> Vec<ToolStage> {
    if let Some(stage) = requested {
        return vec![stage];
    }
    match kind {
        OutputKind::Sql | OutputKind::Report => vec![ToolStage::TaskExecution],
        OutputKind::Chart => vec![ToolStage::TaskExecution, ToolStage::ChartGeneration],
    }
}

/// Run a provider call under the stall guard.
async fn guarded<T, Fut>(guard: &StallGuard, label: &str, call: Fut) -> Result<T, AgentError>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    guard
        .run_with(label, |_token| call)
        .await
        .map_err(|interrupt| match interrupt {
            Interrupt::Cancelled => AgentError::Cancelled,
            Interrupt::Stalled => AgentError::StallTimeout {
                label: label.to_string(),
                threshold: guard.threshold(),
            },
        })?
        .map_err(|e| AgentError::Provider(format!("{}: {:#}", label, e)))
}

impl Inner {
    pub(super) async fn run_task(&self, task_id: TaskId, request: TaskRequest, token: CancellationToken) {
        let events = self.tracker.for_task(task_id);
        let guard = StallGuard::spawn(events, self.config.stall_threshold, token);

        match self.drive(task_id, &request, &guard).await {
            Ok(decision) => {
                self.finish(task_id, decision);
            }
            Err(AgentError::Cancelled) => {
                tracing::debug!(task_id = %task_id, "Task run stopped after cancellation");
            }
            Err(e) => {
                self.finish(task_id, Decision::failure(e.to_string()));
            }
        }
    }

    /// Everything up to the decision. Errors that leave a context behind are
    /// turned into failed decisions here so the partial result is kept.
    async fn drive(
        &self,
        task_id: TaskId,
        request: &TaskRequest,
        guard: &StallGuard,
    ) -> Result<Decision, AgentError> {
        let events = guard.events();
        let mut ctx = match self.build_context(request, guard).await {
            Ok(ctx) => ctx,
            Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
            Err(e) => {
                tracing::warn!(task_id = %task_id, "Context build failed: {}", e);
                return Ok(Decision::failure(e.to_string()));
            }
        };
        tracing::debug!(
            task_id = %task_id,
            tables = ctx.schema.tables.len(),
            omitted_tables = ctx.schema.omitted_tables,
            "Context built"
        );

        let fatal_tools = self.config.fatal_tools.fatal_tools(ctx.output_kind()).to_vec();
        let rounds = stage_rounds(ctx.output_kind(), request.stage);

        for (round, stage) in rounds.iter().copied().enumerate() {
            if round > 0 && stage == ToolStage::ChartGeneration && !ctx.has(ContextField::CurrentSql) {
                tracing::info!(task_id = %task_id, "No SQL after the query round; skipping chart round");
                break;
            }

            self.transition(
                task_id,
                TaskStatus::Planning,
                ProgressUpdate::new(
                    EventStatus::Planning,
                    stage.as_str(),
                    format!("Planning round {} ({})", round + 1, stage),
                )
                .with_percent(0.0)
                .with_current_step("planner"),
            )?;

            let plan = match self.plan_with_retries(&ctx, stage, guard).await {
                Ok(plan) => plan,
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => return Ok(Decision::failure(e.to_string()).with_result(partial_result(&ctx))),
            };

            self.transition(
                task_id,
                TaskStatus::Executing,
                ProgressUpdate::new(
                    EventStatus::Executing,
                    stage.as_str(),
                    format!("Executing {} step(s): {}", plan.len(), plan.tool_names().join(" -> ")),
                ),
            )?;

            let run = match self
                .executor
                .run(round, stage, &plan, &mut ctx, guard, &fatal_tools)
                .await
            {
                Ok(run) => run,
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => return Ok(Decision::failure(e.to_string()).with_result(partial_result(&ctx))),
            };
            if let Some(fatal) = run.fatal {
                tracing::warn!(
                    task_id = %task_id,
                    tool = %fatal.tool,
                    "Fatal tool failed; ending task"
                );
                return Ok(Decision::failure(fatal.error).with_result(partial_result(&ctx)));
            }

            self.transition(
                task_id,
                TaskStatus::Observing,
                ProgressUpdate::new(
                    EventStatus::Observing,
                    stage.as_str(),
                    format!(
                        "Round {} done: {} succeeded, {} failed",
                        round + 1,
                        run.succeeded,
                        run.failed
                    ),
                ),
            )?;
        }

        self.transition(
            task_id,
            TaskStatus::Finalizing,
            ProgressUpdate::new(EventStatus::Finalizing, "finalize", "Finalizing")
                .with_current_step("finalizer"),
        )?;
        let observation = events.observation();
        self.finalizer.finalize(&ctx, &observation, guard).await
    }

    async fn build_context(
        &self,
        request: &TaskRequest,
        guard: &StallGuard,
    ) -> Result<TaskContext, AgentError> {
        let placeholder = match (&request.placeholder, &self.providers.placeholder) {
            (Some(placeholder), _) => Some(placeholder.clone()),
            (None, Some(provider)) => match (&request.template_id, &request.placeholder_id) {
                (Some(template_id), Some(placeholder_id)) => {
                    guarded(
                        guard,
                        "placeholder_provider",
                        provider.placeholder_context(template_id, placeholder_id),
                    )
                    .await?
                }
                _ => None,
            },
            (None, None) => None,
        };

        let time_window = match (&request.time_window, &request.schedule_ref, &self.providers.schedule) {
            (Some(spec), _, _) => Some(spec.clone()),
            (None, Some(schedule_ref), Some(provider)) => {
                guarded(guard, "schedule_provider", provider.time_window_spec(schedule_ref)).await?
            }
            _ => None,
        };

        let required_tables = request
            .required_tables
            .as_ref()
            .map(|tables| sanitize_name_list(tables));
        let schema = match guarded(
            guard,
            "schema_provider",
            self.providers
                .schema
                .schema_summary(&request.data_source_id, required_tables.as_deref()),
        )
        .await
        {
            Ok(schema) => Some(schema),
            Err(AgentError::Provider(message)) => {
                return Err(ContextBuildError::MissingSchema(message).into());
            }
            Err(e) => return Err(e),
        };

        let ctx = self.builder.build(ContextInputs {
            task_description: request.task_description.clone(),
            data_source_id: request.data_source_id.clone(),
            placeholder,
            schema,
            time_window,
            constraints: Constraints {
                output_kind: request.output_kind,
            },
        })?;
        Ok(ctx)
    }

    /// Plan one round, retrying with the strict prompt after a rejection.
    async fn plan_with_retries(
        &self,
        ctx: &TaskContext,
        stage: ToolStage,
        guard: &StallGuard,
    ) -> Result<ExecutionPlan, AgentError> {
        let events: &TaskEvents = guard.events();
        let tools = self.registry.for_stage(stage);
        let attempts = self.config.plan_max_attempts.max(1);
        let mut previous: Option<String> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self
                .planner
                .plan(ctx, &tools, stage, previous.as_deref(), guard)
                .await
            {
                Ok(plan) => {
                    events.emit(ProgressUpdate::new(
                        EventStatus::Planning,
                        stage.as_str(),
                        format!("Plan ready: {}", plan.thought),
                    ));
                    return Ok(plan);
                }
                Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => e,
            };

            tracing::warn!(attempt, attempts, "Plan attempt rejected: {}", error);
            events.emit(
                ProgressUpdate::new(
                    EventStatus::Planning,
                    stage.as_str(),
                    format!("Plan attempt {}/{} rejected", attempt, attempts),
                )
                .with_error(error.to_string()),
            );
            if attempt >= attempts || !error.is_retryable() {
                return Err(error);
            }
            previous = Some(error.to_string());
        }
    }
}
