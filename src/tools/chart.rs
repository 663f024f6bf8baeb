//! `chart.build`: turn the execution result into an ECharts-style option
//! object and persist it through a [`ChartRenderer`].

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::{input_str, Tool, ToolStage};
use crate::context::{ContextField, ExecutionResult, TaskContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartType {
    Bar,
    Line,
    Pie,
}

impl ChartType {
    /// Pick a chart type from an explicit name or a placeholder kind such
    /// as `chart_line`. Defaults to bar.
    pub fn infer(explicit: Option<&str>, placeholder_kind: &str) -> Self {
        let hint = explicit.unwrap_or(placeholder_kind).to_ascii_lowercase();
        if hint.contains("line") || hint.contains("trend") {
            ChartType::Line
        } else if hint.contains("pie") || hint.contains("share") {
            ChartType::Pie
        } else {
            ChartType::Bar
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Line => "line",
            ChartType::Pie => "pie",
        }
    }
}

/// Persists a chart spec and returns where it went.
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(&self, label: &str, spec: &Value) -> anyhow::Result<String>;
}

/// Writes each spec as pretty JSON under an output directory.
#[derive(Debug, Clone)]
pub struct JsonChartRenderer {
    output_dir: PathBuf,
}

impl JsonChartRenderer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

fn file_stem(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "chart".to_string()
    } else {
        cleaned.to_string()
    }
}

#[async_trait]
impl ChartRenderer for JsonChartRenderer {
    async fn render(&self, label: &str, spec: &Value) -> anyhow::Result<String> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let path = self
            .output_dir
            .join(format!("{}-{}.json", file_stem(label), &id[..8]));
        let body = serde_json::to_vec_pretty(spec)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write chart {}", path.display()))?;
        Ok(path.display().to_string())
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn label(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        Value::Null => Value::String("(null)".to_string()),
        other => Value::String(other.to_string()),
    }
}

/// Build the option object for `result`.
///
/// The first column is the category axis when there are at least two
/// columns; every other numeric column becomes a series. With a single
/// column the row number is the category.
pub fn build_chart_spec(
    result: &ExecutionResult,
    title: &str,
    chart_type: ChartType,
) -> anyhow::Result<Value> {
    if result.rows.is_empty() {
        bail!("query returned no rows to chart");
    }
    if result.columns.is_empty() {
        bail!("query returned no columns to chart");
    }

    let (categories, value_columns): (Vec<Value>, Vec<usize>) = if result.columns.len() == 1 {
        (
            (1..=result.rows.len()).map(|i| Value::String(i.to_string())).collect(),
            vec![0],
        )
    } else {
        (
            result.rows.iter().map(|r| label(r.first().unwrap_or(&Value::Null))).collect(),
            (1..result.columns.len()).collect(),
        )
    };

    let mut series = Vec::new();
    for col in value_columns {
        let values: Vec<Option<f64>> = result
            .rows
            .iter()
            .map(|r| r.get(col).and_then(number))
            .collect();
        if values.iter().all(Option::is_none) {
            continue;
        }
        let name = &result.columns[col];
        let entry = match chart_type {
            ChartType::Pie => json!({
                "name": name,
                "type": "pie",
                "data": categories
                    .iter()
                    .zip(&values)
                    .map(|(c, v)| json!({"name": c, "value": v}))
                    .collect::<Vec<_>>(),
            }),
            other => json!({
                "name": name,
                "type": other.as_str(),
                "data": values,
            }),
        };
        series.push(entry);
        if chart_type == ChartType::Pie {
            break;
        }
    }
    if series.is_empty() {
        bail!("no numeric column to plot");
    }

    let mut spec = json!({
        "title": {"text": title},
        "tooltip": {},
        "legend": {},
        "series": series,
    });
    if chart_type != ChartType::Pie {
        spec["xAxis"] = json!({"type": "category", "data": categories});
        spec["yAxis"] = json!({"type": "value"});
    }
    Ok(spec)
}

/// Builds and persists a chart from `execution_result`.
pub struct ChartBuild {
    renderer: Arc<dyn ChartRenderer>,
}

impl ChartBuild {
    pub fn new(renderer: Arc<dyn ChartRenderer>) -> Self {
        Self { renderer }
    }
}

#[async_trait]
impl Tool for ChartBuild {
    fn name(&self) -> &str {
        "chart.build"
    }

    fn description(&self) -> &str {
        "Build a chart (bar, line or pie) from the query result and save its spec."
    }

    fn stages(&self) -> &[ToolStage] {
        &[ToolStage::ChartGeneration]
    }

    fn reads(&self) -> &[ContextField] {
        &[ContextField::ExecutionResult]
    }

    fn writes(&self) -> &[ContextField] {
        &[ContextField::ChartSpec, ContextField::ChartImagePath]
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chart_type": {"type": "string", "enum": ["bar", "line", "pie"]},
                "title": {"type": "string"}
            }
        })
    }

    async fn execute(
        &self,
        input: &Map<String, Value>,
        ctx: &TaskContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Map<String, Value>> {
        let result = ctx
            .execution_result
            .as_ref()
            .context("no execution result")?;
        let chart_type = ChartType::infer(input_str(input, "chart_type"), &ctx.placeholder.kind);
        let title = input_str(input, "title").unwrap_or(&ctx.placeholder.name);

        let spec = build_chart_spec(result, title, chart_type)?;
        let path = self.renderer.render(&ctx.placeholder.name, &spec).await?;
        tracing::debug!(path = %path, chart_type = chart_type.as_str(), "Chart rendered");

        let mut out = Map::new();
        out.insert(ContextField::ChartSpec.to_string(), spec);
        out.insert(ContextField::ChartImagePath.to_string(), Value::String(path));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::fixtures::orders_context;
    use crate::task::OutputKind;

    fn result() -> ExecutionResult {
        ExecutionResult {
            columns: vec!["day".to_string(), "total".to_string()],
            rows: vec![
                vec![json!("2024-01-01"), json!(10.5)],
                vec![json!("2024-01-02"), json!("20")],
            ],
            truncated: false,
        }
    }

    #[test]
    fn bar_spec_has_axes_and_series() {
        let spec = build_chart_spec(&result(), "Daily totals", ChartType::Bar).expect("spec");
        assert_eq!(spec["title"]["text"], json!("Daily totals"));
        assert_eq!(spec["xAxis"]["data"], json!(["2024-01-01", "2024-01-02"]));
        assert_eq!(spec["series"][0]["type"], json!("bar"));
        assert_eq!(spec["series"][0]["data"], json!([10.5, 20.0]));
    }

    #[test]
    fn pie_spec_uses_name_value_pairs() {
        let spec = build_chart_spec(&result(), "Share", ChartType::Pie).expect("spec");
        assert!(spec.get("xAxis").is_none());
        assert_eq!(
            spec["series"][0]["data"][0],
            json!({"name": "2024-01-01", "value": 10.5})
        );
    }

    #[test]
    fn empty_or_non_numeric_results_fail() {
        let empty = ExecutionResult {
            columns: vec!["a".to_string()],
            rows: vec![],
            truncated: false,
        };
        assert!(build_chart_spec(&empty, "t", ChartType::Bar).is_err());

        let text_only = ExecutionResult {
            columns: vec!["a".to_string(), "b".to_string()],
            rows: vec![vec![json!("x"), json!("y")]],
            truncated: false,
        };
        assert!(build_chart_spec(&text_only, "t", ChartType::Line).is_err());
    }

    #[test]
    fn chart_type_inference() {
        assert_eq!(ChartType::infer(None, "chart_line"), ChartType::Line);
        assert_eq!(ChartType::infer(Some("pie"), "chart_line"), ChartType::Pie);
        assert_eq!(ChartType::infer(None, "statistic"), ChartType::Bar);
    }

    #[tokio::test]
    async fn build_persists_spec_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tool = ChartBuild::new(Arc::new(JsonChartRenderer::new(dir.path())));
        let mut ctx = orders_context(OutputKind::Chart);
        ctx.execution_result = Some(result());

        let out = tool
            .execute(&Map::new(), &ctx, &CancellationToken::new())
            .await
            .expect("chart");
        let path = out["chart_image_path"].as_str().expect("path").to_string();
        assert!(path.contains("total_refund-"));

        let written: Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(written, out["chart_spec"]);
    }
}
