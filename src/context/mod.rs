//! Per-task context: the merged, bounded view of schema, placeholder and
//! schedule inputs, plus scratch fields written by tool steps.
//!
//! # Invariants
//! - each task owns exactly one `TaskContext`; it is never shared
//! - only scratch fields are writable after build, and writes are
//!   replace-only (last write wins per field)

mod builder;
mod catalog;
mod providers;

pub use builder::{ContextBuildError, ContextBuilder, ContextInputs, ContextLimits};
pub use catalog::{Catalog, DataSourceEntry, PlaceholderEntry, ScheduleEntry, TemplateEntry};
pub use providers::{PlaceholderProvider, ScheduleProvider, SchemaProvider};

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::task::OutputKind;

/// Template placeholder being resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-form kind from the template, e.g. `statistic`, `chart_bar`.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub surrounding_text: Option<String>,
}

/// Bounded schema summary of one data source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub tables: Vec<String>,
    #[serde(default)]
    pub columns_by_table: BTreeMap<String, Vec<String>>,
    /// Tables dropped by the context cap.
    #[serde(default)]
    pub omitted_tables: usize,
    /// Columns dropped by the per-table cap, summed over kept tables.
    #[serde(default)]
    pub omitted_columns: usize,
}

impl SchemaSummary {
    pub fn new(tables: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            tables: tables.keys().cloned().collect(),
            columns_by_table: tables,
            omitted_tables: 0,
            omitted_columns: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Case-insensitive table lookup, returning the canonical name.
    pub fn find_table(&self, name: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|t| t.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }

    /// Whether the summary lists every table of the source.
    pub fn is_complete(&self) -> bool {
        self.omitted_tables == 0
    }

    /// Compact text rendering used in prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            let columns = self
                .columns_by_table
                .get(table)
                .map(|c| c.join(", "))
                .unwrap_or_default();
            out.push_str(&format!("- {}({})\n", table, columns));
        }
        if self.omitted_tables > 0 || self.omitted_columns > 0 {
            out.push_str(&format!(
                "({} more tables and {} more columns omitted)\n",
                self.omitted_tables, self.omitted_columns
            ));
        }
        out
    }
}

/// Schedule-derived time window specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindowSpec {
    /// 5-field cron expression of the report schedule.
    pub cron_expr: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Periods back from the current one (1 = previous period).
    #[serde(default)]
    pub offset: i32,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub output_kind: OutputKind,
}

/// Rows returned by `sql.execute`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Set when the row cap cut the result short.
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Period granularity inferred from a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    Weekly,
    Monthly,
}

/// Concrete half-open `[start, end)` window, RFC 3339 in the schedule's zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedWindow {
    pub start: String,
    pub end: String,
    pub granularity: Granularity,
}

/// Addressable fields of a [`TaskContext`], as used in tool declarations
/// and in tool output maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextField {
    TaskDescription,
    Placeholder,
    Schema,
    TimeWindow,
    CurrentSql,
    ExecutionResult,
    ChartSpec,
    ChartImagePath,
    ResolvedWindow,
    ReportText,
}

impl ContextField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextField::TaskDescription => "task_description",
            ContextField::Placeholder => "placeholder",
            ContextField::Schema => "schema",
            ContextField::TimeWindow => "time_window",
            ContextField::CurrentSql => "current_sql",
            ContextField::ExecutionResult => "execution_result",
            ContextField::ChartSpec => "chart_spec",
            ContextField::ChartImagePath => "chart_image_path",
            ContextField::ResolvedWindow => "resolved_window",
            ContextField::ReportText => "report_text",
        }
    }

    /// Scratch fields are the only ones tools may write.
    pub fn is_scratch(&self) -> bool {
        !matches!(
            self,
            ContextField::TaskDescription
                | ContextField::Placeholder
                | ContextField::Schema
                | ContextField::TimeWindow
        )
    }
}

impl std::fmt::Display for ContextField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextField {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s {
            "task_description" => ContextField::TaskDescription,
            "placeholder" => ContextField::Placeholder,
            "schema" => ContextField::Schema,
            "time_window" => ContextField::TimeWindow,
            "current_sql" => ContextField::CurrentSql,
            "execution_result" => ContextField::ExecutionResult,
            "chart_spec" => ContextField::ChartSpec,
            "chart_image_path" => ContextField::ChartImagePath,
            "resolved_window" => ContextField::ResolvedWindow,
            "report_text" => ContextField::ReportText,
            other => return Err(MergeError::UnknownField(other.to_string())),
        };
        Ok(field)
    }
}

/// A tool output that could not be folded into the context.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeError {
    #[error("unknown context field `{0}`")]
    UnknownField(String),

    #[error("field `{field}` has the wrong shape: {message}")]
    InvalidValue { field: ContextField, message: String },
}

/// The merged context owned by one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_description: String,
    pub placeholder: PlaceholderInfo,
    pub data_source_id: String,
    pub schema: SchemaSummary,
    pub time_window: Option<TimeWindowSpec>,
    pub constraints: Constraints,

    pub current_sql: Option<String>,
    pub execution_result: Option<ExecutionResult>,
    pub chart_spec: Option<Value>,
    pub chart_image_path: Option<String>,
    pub resolved_window: Option<ResolvedWindow>,
    pub report_text: Option<String>,
}

impl TaskContext {
    pub fn output_kind(&self) -> OutputKind {
        self.constraints.output_kind
    }

    /// Whether `field` currently holds a usable value.
    pub fn has(&self, field: ContextField) -> bool {
        match field {
            ContextField::TaskDescription => !self.task_description.trim().is_empty(),
            ContextField::Placeholder => !self.placeholder.name.trim().is_empty(),
            ContextField::Schema => !self.schema.is_empty(),
            ContextField::TimeWindow => self.time_window.is_some(),
            ContextField::CurrentSql => self
                .current_sql
                .as_deref()
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false),
            ContextField::ExecutionResult => self.execution_result.is_some(),
            ContextField::ChartSpec => self.chart_spec.is_some(),
            ContextField::ChartImagePath => self.chart_image_path.is_some(),
            ContextField::ResolvedWindow => self.resolved_window.is_some(),
            ContextField::ReportText => self
                .report_text
                .as_deref()
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false),
        }
    }

    pub fn row_count(&self) -> Option<usize> {
        self.execution_result.as_ref().map(ExecutionResult::row_count)
    }

    /// Fold a tool output into the scratch fields.
    ///
    /// Only keys naming a field in `allowed` that is also a scratch field
    /// are applied; everything else is ignored. `null` values are skipped.
    /// Values are validated before anything is written, so a bad output
    /// leaves the context untouched. Applying the same output twice yields
    /// the same context as applying it once.
    ///
    /// Returns the fields that were written.
    pub fn merge(
        &mut self,
        output: &Map<String, Value>,
        allowed: &[ContextField],
    ) -> Result<Vec<ContextField>, MergeError> {
        let mut staged = Vec::new();
        for (key, value) in output {
            let field = match key.parse::<ContextField>() {
                Ok(field) => field,
                Err(_) => {
                    tracing::debug!(key = %key, "Ignoring unknown output key");
                    continue;
                }
            };
            if !field.is_scratch() || !allowed.contains(&field) {
                tracing::debug!(field = %field, "Ignoring undeclared output field");
                continue;
            }
            if value.is_null() {
                continue;
            }
            staged.push((field, Self::check_value(field, value)?));
        }

        let mut written = Vec::with_capacity(staged.len());
        for (field, value) in staged {
            self.apply(field, value);
            written.push(field);
        }
        Ok(written)
    }

    fn check_value(field: ContextField, value: &Value) -> Result<ScratchValue, MergeError> {
        let invalid = |message: String| MergeError::InvalidValue { field, message };
        let text = |value: &Value| {
            value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid("expected a string".to_string()))
        };
        let checked = match field {
            ContextField::CurrentSql => ScratchValue::Text(text(value)?),
            ContextField::ChartImagePath => ScratchValue::Text(text(value)?),
            ContextField::ReportText => ScratchValue::Text(text(value)?),
            ContextField::ChartSpec => {
                if !value.is_object() {
                    return Err(invalid("expected an object".to_string()));
                }
                ScratchValue::Json(value.clone())
            }
            ContextField::ExecutionResult => ScratchValue::Result(
                serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?,
            ),
            ContextField::ResolvedWindow => ScratchValue::Window(
                serde_json::from_value(value.clone()).map_err(|e| invalid(e.to_string()))?,
            ),
            other => {
                return Err(MergeError::InvalidValue {
                    field: other,
                    message: "not writable".to_string(),
                })
            }
        };
        Ok(checked)
    }

    fn apply(&mut self, field: ContextField, value: ScratchValue) {
        match (field, value) {
            (ContextField::CurrentSql, ScratchValue::Text(s)) => self.current_sql = Some(s),
            (ContextField::ChartImagePath, ScratchValue::Text(s)) => {
                self.chart_image_path = Some(s)
            }
            (ContextField::ReportText, ScratchValue::Text(s)) => self.report_text = Some(s),
            (ContextField::ChartSpec, ScratchValue::Json(v)) => self.chart_spec = Some(v),
            (ContextField::ExecutionResult, ScratchValue::Result(r)) => {
                self.execution_result = Some(r)
            }
            (ContextField::ResolvedWindow, ScratchValue::Window(w)) => {
                self.resolved_window = Some(w)
            }
            _ => {}
        }
    }

    /// Task header shared by the planner and tool prompts.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Task: {}\nOutput kind: {}\nData source: {}\nPlaceholder: {}",
            self.task_description,
            self.output_kind(),
            self.data_source_id,
            self.placeholder.name
        );
        if !self.placeholder.kind.is_empty() {
            out.push_str(&format!(" ({})", self.placeholder.kind));
        }
        if !self.placeholder.description.is_empty() {
            out.push_str(&format!("\nPlaceholder description: {}", self.placeholder.description));
        }
        if let Some(text) = &self.placeholder.surrounding_text {
            out.push_str(&format!("\nSurrounding text: {}", text));
        }
        if let Some(window) = &self.resolved_window {
            out.push_str(&format!(
                "\nTime window: {} to {} ({:?})",
                window.start, window.end, window.granularity
            ));
        } else if let Some(spec) = &self.time_window {
            out.push_str(&format!(
                "\nSchedule: cron `{}` in {}, offset {}",
                spec.cron_expr, spec.timezone, spec.offset
            ));
        }
        out
    }
}

enum ScratchValue {
    Text(String),
    Json(Value),
    Result(ExecutionResult),
    Window(ResolvedWindow),
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// `orders(id, amount, created_at)` context for `kind`.
    pub(crate) fn orders_context(kind: OutputKind) -> TaskContext {
        let mut tables = BTreeMap::new();
        tables.insert(
            "orders".to_string(),
            vec![
                "id".to_string(),
                "amount".to_string(),
                "created_at".to_string(),
            ],
        );
        TaskContext {
            task_description: "compute total refund amount for orders table".to_string(),
            placeholder: PlaceholderInfo {
                name: "total_refund".to_string(),
                description: "Total refund amount".to_string(),
                kind: "statistic".to_string(),
                surrounding_text: None,
            },
            data_source_id: "main".to_string(),
            schema: SchemaSummary::new(tables),
            time_window: None,
            constraints: Constraints { output_kind: kind },
            current_sql: None,
            execution_result: None,
            chart_spec: None,
            chart_image_path: None,
            resolved_window: None,
            report_text: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::orders_context;
    use super::*;
    use serde_json::json;

    fn output(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn merge_is_idempotent() {
        let mut ctx = orders_context(OutputKind::Sql);
        let out = output(json!({
            "current_sql": "SELECT SUM(amount) FROM orders",
            "execution_result": {"columns": ["total"], "rows": [[42.5]]}
        }));
        let allowed = [ContextField::CurrentSql, ContextField::ExecutionResult];

        ctx.merge(&out, &allowed).expect("first merge");
        let once = ctx.clone();
        ctx.merge(&out, &allowed).expect("second merge");

        assert_eq!(ctx, once);
        assert_eq!(ctx.current_sql.as_deref(), Some("SELECT SUM(amount) FROM orders"));
        assert_eq!(ctx.row_count(), Some(1));
    }

    #[test]
    fn last_write_wins_per_field() {
        let mut ctx = orders_context(OutputKind::Sql);
        let allowed = [ContextField::CurrentSql];
        ctx.merge(&output(json!({"current_sql": "SELECT 1"})), &allowed)
            .expect("merge");
        ctx.merge(&output(json!({"current_sql": "SELECT 2"})), &allowed)
            .expect("merge");
        assert_eq!(ctx.current_sql.as_deref(), Some("SELECT 2"));
    }

    #[test]
    fn undeclared_and_base_fields_are_ignored() {
        let mut ctx = orders_context(OutputKind::Sql);
        let before = ctx.clone();
        let written = ctx
            .merge(
                &output(json!({
                    "task_description": "hijack",
                    "report_text": "not declared",
                    "bogus": 1
                })),
                &[ContextField::CurrentSql, ContextField::TaskDescription],
            )
            .expect("merge");
        assert!(written.is_empty());
        assert_eq!(ctx, before);
    }

    #[test]
    fn bad_shape_leaves_context_untouched() {
        let mut ctx = orders_context(OutputKind::Sql);
        let err = ctx
            .merge(
                &output(json!({"current_sql": "SELECT 1", "execution_result": "oops"})),
                &[ContextField::CurrentSql, ContextField::ExecutionResult],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            MergeError::InvalidValue {
                field: ContextField::ExecutionResult,
                ..
            }
        ));
        assert!(ctx.current_sql.is_none());
    }

    #[test]
    fn has_reports_blank_sql_as_missing() {
        let mut ctx = orders_context(OutputKind::Sql);
        assert!(!ctx.has(ContextField::CurrentSql));
        ctx.current_sql = Some("  ".to_string());
        assert!(!ctx.has(ContextField::CurrentSql));
        assert!(ctx.has(ContextField::Schema));
        assert!(!ctx.has(ContextField::TimeWindow));
    }

    #[test]
    fn schema_render_mentions_omissions() {
        let mut ctx = orders_context(OutputKind::Sql);
        ctx.schema.omitted_tables = 3;
        let text = ctx.schema.render();
        assert!(text.contains("- orders(id, amount, created_at)"));
        assert!(text.contains("3 more tables"));
    }
}
