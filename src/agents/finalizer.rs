//! Finalizer: asks the model for the terminal decision and re-validates any
//! claimed success against the context.

use crate::agents::AgentError;
use crate::context::TaskContext;
use crate::llm::Completer;
use crate::progress::{Interrupt, Observation, StallGuard};
use crate::task::{Decision, DecisionDraft, OutputKind};
use crate::tools::{cell_text, check_sql_syntax};
use crate::util::truncate_chars;

/// Quality ceiling for a decision whose claimed success was rejected.
const REJECTED_QUALITY_CAP: f64 = 0.3;
const SAMPLE_ROWS: usize = 5;

const SYSTEM_PROMPT: &str = r#"You review the outcome of a reporting task and decide whether it produced the requested output.

Reply with exactly one JSON object and nothing else:
{"success": true|false, "result": "<the SQL, chart reference or report text>", "reasoning": "<short justification>", "quality_score": <number between 0 and 1>}

Claim success only when the requested output exists and answers the task."#;

#[derive(Debug, Clone)]
pub struct Finalizer {
    completer: Completer,
}

impl Finalizer {
    pub fn new(completer: Completer) -> Self {
        Self { completer }
    }

    pub fn build_prompt(&self, ctx: &TaskContext, obs: &Observation) -> String {
        let mut prompt = format!(
            "Task: {}\nOutput kind: {}\nPlaceholder: {}\n\nRun summary:\n{}",
            ctx.task_description,
            ctx.output_kind(),
            ctx.placeholder.name,
            obs.summary()
        );
        if let Some(result) = &ctx.execution_result {
            prompt.push_str(&format!("\nColumns: {}\n", result.columns.join(", ")));
            for row in result.rows.iter().take(SAMPLE_ROWS) {
                let cells: Vec<String> = row.iter().map(cell_text).collect();
                prompt.push_str(&format!("| {} |\n", cells.join(" | ")));
            }
        }
        if let Some(path) = &ctx.chart_image_path {
            prompt.push_str(&format!("\nChart saved at: {}\n", path));
        }
        if let Some(text) = &ctx.report_text {
            prompt.push_str(&format!("\nReport text:\n{}\n", truncate_chars(text, 2000)));
        }
        prompt
    }

    /// Produce the task's decision.
    ///
    /// Model errors, stalls and malformed replies become failed decisions;
    /// only cancellation is returned as an error.
    pub async fn finalize(
        &self,
        ctx: &TaskContext,
        obs: &Observation,
        guard: &StallGuard,
    ) -> Result<Decision, AgentError> {
        let prompt = self.build_prompt(ctx, obs);
        let reply = guard
            .run_with("finalizer", |_token| {
                self.completer.complete(Some(SYSTEM_PROMPT), &prompt)
            })
            .await;

        let reply = match reply {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                let error = AgentError::Llm(format!("{:#}", e));
                return Ok(Decision::failure(error.to_string()).with_result(partial_result(ctx)));
            }
            Err(Interrupt::Cancelled) => return Err(AgentError::Cancelled),
            Err(Interrupt::Stalled) => {
                let error = AgentError::StallTimeout {
                    label: "finalizer".to_string(),
                    threshold: guard.threshold(),
                };
                return Ok(Decision::failure(error.to_string()).with_result(partial_result(ctx)));
            }
        };

        Ok(match DecisionDraft::parse(&reply) {
            Ok(draft) => validate(draft, ctx),
            Err(e) => {
                tracing::warn!("Finalizer reply rejected: {}", e);
                let error = AgentError::FinalizeValidation(e.to_string());
                Decision::failure(error.to_string()).with_result(partial_result(ctx))
            }
        })
    }
}

/// Best available output for a failed decision.
pub(crate) fn partial_result(ctx: &TaskContext) -> String {
    let value = match ctx.output_kind() {
        OutputKind::Sql => ctx.current_sql.clone(),
        OutputKind::Chart => ctx
            .chart_image_path
            .clone()
            .or_else(|| ctx.current_sql.clone()),
        OutputKind::Report => ctx.report_text.clone(),
    };
    value.unwrap_or_default()
}

/// Check a claimed success against the context; a model-reported failure
/// passes through with the partial result filled in.
fn validate(draft: DecisionDraft, ctx: &TaskContext) -> Decision {
    if !draft.success {
        let result = if draft.result.trim().is_empty() {
            partial_result(ctx)
        } else {
            draft.result
        };
        return Decision::new(false, result, draft.reasoning, draft.quality_score);
    }

    let checked = match ctx.output_kind() {
        OutputKind::Sql => match &ctx.current_sql {
            None => Err("no SQL in context".to_string()),
            Some(sql) => check_sql_syntax(sql)
                .map(|_| sql.clone())
                .map_err(|e| format!("context SQL fails the syntax check: {}", e)),
        },
        OutputKind::Chart => match &ctx.chart_spec {
            None => Err("no chart spec in context".to_string()),
            Some(spec) => Ok(ctx
                .chart_image_path
                .clone()
                .unwrap_or_else(|| spec.to_string())),
        },
        OutputKind::Report => {
            if !draft.result.trim().is_empty() {
                Ok(draft.result.clone())
            } else {
                ctx.report_text
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| "empty report text".to_string())
            }
        }
    };

    match checked {
        Ok(result) => Decision::new(true, result, draft.reasoning, draft.quality_score),
        Err(reason) => {
            tracing::warn!("Claimed success rejected: {}", reason);
            let error = AgentError::FinalizeValidation(reason);
            Decision::new(
                false,
                partial_result(ctx),
                format!("{} (model reasoning: {})", error, draft.reasoning),
                draft.quality_score.min(REJECTED_QUALITY_CAP),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::context::fixtures::orders_context;
    use crate::llm::scripted::{Reply, ScriptedLlm};
    use crate::progress::ProgressTracker;
    use crate::context::ExecutionResult;
    use crate::task::TaskId;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn finalizer(replies: Vec<Reply>) -> Finalizer {
        Finalizer::new(Completer::new(Arc::new(ScriptedLlm::with_replies(replies)), "m"))
    }

    fn guard(threshold: Duration) -> StallGuard {
        let tracker = ProgressTracker::new(MessageBus::new());
        StallGuard::spawn(tracker.for_task(TaskId::new()), threshold, CancellationToken::new())
    }

    fn success_reply(result: &str, score: f64) -> Reply {
        Reply::Text(format!(
            r#"{{"success": true, "result": "{}", "reasoning": "looks right", "quality_score": {}}}"#,
            result, score
        ))
    }

    #[tokio::test]
    async fn sql_success_uses_context_sql() {
        let mut ctx = orders_context(OutputKind::Sql);
        ctx.current_sql = Some("SELECT SUM(amount) FROM orders".to_string());
        let decision = finalizer(vec![success_reply("whatever", 0.9)])
            .finalize(&ctx, &Observation::default(), &guard(Duration::from_secs(30)))
            .await
            .expect("decision");
        assert!(decision.success);
        assert_eq!(decision.result, "SELECT SUM(amount) FROM orders");
        assert_eq!(decision.quality_score, 0.9);
    }

    #[tokio::test]
    async fn claimed_success_without_sql_is_downgraded() {
        let ctx = orders_context(OutputKind::Sql);
        let decision = finalizer(vec![success_reply("SELECT 1", 0.95)])
            .finalize(&ctx, &Observation::default(), &guard(Duration::from_secs(30)))
            .await
            .expect("decision");
        assert!(!decision.success);
        assert!(decision.reasoning.starts_with("FinalizeValidationError:"));
        assert!(decision.quality_score <= REJECTED_QUALITY_CAP);
    }

    #[tokio::test]
    async fn chart_success_requires_spec() {
        let mut ctx = orders_context(OutputKind::Chart);
        ctx.current_sql = Some("SELECT 1".to_string());
        let decision = finalizer(vec![success_reply("chart", 0.8)])
            .finalize(&ctx, &Observation::default(), &guard(Duration::from_secs(30)))
            .await
            .expect("decision");
        assert!(!decision.success);
        assert_eq!(decision.result, "SELECT 1");
    }

    #[tokio::test]
    async fn malformed_reply_becomes_failure() {
        let mut ctx = orders_context(OutputKind::Report);
        ctx.report_text = Some("draft text".to_string());
        let decision = finalizer(vec![Reply::Text("all good!".to_string())])
            .finalize(&ctx, &Observation::default(), &guard(Duration::from_secs(30)))
            .await
            .expect("decision");
        assert!(!decision.success);
        assert_eq!(decision.result, "draft text");
        assert!(decision.reasoning.contains("no JSON object"));
    }

    #[tokio::test]
    async fn stalled_model_call_fails_the_decision() {
        let ctx = orders_context(OutputKind::Report);
        let decision = tokio::time::timeout(
            Duration::from_secs(5),
            finalizer(vec![Reply::Hang]).finalize(
                &ctx,
                &Observation::default(),
                &guard(Duration::from_millis(100)),
            ),
        )
        .await
        .expect("bounded")
        .expect("decision");
        assert!(!decision.success);
        assert!(decision.reasoning.starts_with("StallTimeoutError:"));
    }

    #[test]
    fn prompt_caps_long_cells() {
        let mut ctx = orders_context(OutputKind::Report);
        let long = "x".repeat(5_000);
        ctx.execution_result = Some(ExecutionResult {
            columns: vec!["note".to_string()],
            rows: vec![vec![json!(long)]],
            truncated: false,
        });
        let prompt = finalizer(vec![]).build_prompt(&ctx, &Observation::default());
        assert!(prompt.len() < 1_500);
        assert!(prompt.contains(&"x".repeat(100)));
    }

    #[tokio::test]
    async fn model_error_becomes_failed_decision() {
        let mut ctx = orders_context(OutputKind::Sql);
        ctx.current_sql = Some("SELECT 1".to_string());
        let decision = finalizer(vec![Reply::Fail("upstream 502".to_string())])
            .finalize(&ctx, &Observation::default(), &guard(Duration::from_secs(30)))
            .await
            .expect("decision");
        assert!(!decision.success);
        assert!(decision.reasoning.starts_with("Model call failed:"));
        assert!(decision.reasoning.contains("upstream 502"));
        assert_eq!(decision.result, "SELECT 1");
    }
}
