//! `reasoning`: free-form model call that writes report text.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::{cell_text, input_str, Tool, ToolStage};
use crate::context::{ContextField, TaskContext};
use crate::llm::Completer;

const SAMPLE_ROWS: usize = 20;

const SYSTEM_PROMPT: &str = "You write short, factual passages for business reports. \
Use only the data you are given. If the data is missing or inconclusive, say so plainly. \
Reply with the passage text only.";

/// Writes `report_text` from the task, the current SQL and a sample of rows.
pub struct Reasoning {
    completer: Completer,
}

impl Reasoning {
    pub fn new(completer: Completer) -> Self {
        Self { completer }
    }

    fn build_prompt(input: &Map<String, Value>, ctx: &TaskContext) -> String {
        let mut prompt = ctx.describe();

        if let Some(sql) = &ctx.current_sql {
            prompt.push_str(&format!("\n\nSQL used:\n{}", sql));
        }
        if let Some(result) = &ctx.execution_result {
            prompt.push_str(&format!(
                "\n\nResult: {} row(s){}, columns: {}",
                result.row_count(),
                if result.truncated { " (truncated)" } else { "" },
                result.columns.join(", ")
            ));
            for row in result.rows.iter().take(SAMPLE_ROWS) {
                let cells: Vec<String> = row.iter().map(cell_text).collect();
                prompt.push_str(&format!("\n| {} |", cells.join(" | ")));
            }
        }
        if let Some(question) = input_str(input, "question") {
            prompt.push_str(&format!("\n\nQuestion: {}", question));
        }
        if let Some(focus) = input_str(input, "focus") {
            prompt.push_str(&format!("\nFocus on: {}", focus));
        }
        prompt
    }
}

#[async_trait]
impl Tool for Reasoning {
    fn name(&self) -> &str {
        "reasoning"
    }

    fn description(&self) -> &str {
        "Write report text for the placeholder from the task and any query results."
    }

    fn stages(&self) -> &[ToolStage] {
        &ToolStage::ALL
    }

    fn reads(&self) -> &[ContextField] {
        &[ContextField::TaskDescription]
    }

    fn writes(&self) -> &[ContextField] {
        &[ContextField::ReportText]
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "focus": {"type": "string"}
            }
        })
    }

    async fn execute(
        &self,
        input: &Map<String, Value>,
        ctx: &TaskContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Map<String, Value>> {
        let prompt = Self::build_prompt(input, ctx);
        let text = self.completer.complete(Some(SYSTEM_PROMPT), &prompt).await?;

        let mut out = Map::new();
        out.insert(
            ContextField::ReportText.to_string(),
            Value::String(text.trim().to_string()),
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::orders_context;
    use crate::context::ExecutionResult;
    use crate::llm::scripted::ScriptedLlm;
    use crate::task::OutputKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn writes_trimmed_report_text() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            "  Refunds totalled 42.5 last month.\n".to_string(),
        ]));
        let tool = Reasoning::new(Completer::new(llm.clone(), "test/model"));

        let mut ctx = orders_context(OutputKind::Report);
        ctx.current_sql = Some("SELECT SUM(amount) FROM orders".to_string());
        ctx.execution_result = Some(ExecutionResult {
            columns: vec!["total".to_string()],
            rows: vec![vec![json!(42.5)]],
            truncated: false,
        });
        let mut input = Map::new();
        input.insert("focus".to_string(), json!("month over month"));

        let out = tool
            .execute(&input, &ctx, &CancellationToken::new())
            .await
            .expect("reasoning");
        assert_eq!(out["report_text"], json!("Refunds totalled 42.5 last month."));

        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("SELECT SUM(amount) FROM orders"));
        assert!(prompt.contains("| 42.5 |"));
        assert!(prompt.contains("Focus on: month over month"));
    }
}
