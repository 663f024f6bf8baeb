//! Tool system for the orchestrator.
//!
//! Tools are the only way a plan touches the outside world: drafting and
//! checking SQL, running it, building charts, resolving time windows and
//! writing report text. Each tool declares which context fields it reads and
//! which it writes, and the registry enforces both sides of that contract.
//!
//! ## Stages
//!
//! A tool is advertised to the planner only in the stages it lists, so a
//! plan cannot ask for a chart before a query exists.

mod chart;
mod reasoning;
mod sql;
mod time_window;

pub use chart::{build_chart_spec, ChartBuild, ChartRenderer, ChartType, JsonChartRenderer};
pub use reasoning::Reasoning;
pub use sql::{check_sql_syntax, check_sql_tables, SqlCheckError, SqlDraft, SqlExecute, SqlValidate};
pub use time_window::{infer_granularity, parse_timezone, resolve_window, TimeWindowResolve};

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::agents::AgentError;
use crate::context::{ContextField, TaskContext};
use crate::datasource::QueryExecutor;
use crate::llm::Completer;

/// Pipeline phase a tool may be planned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStage {
    TemplateParse,
    TaskExecution,
    ChartGeneration,
}

impl ToolStage {
    pub const ALL: [ToolStage; 3] = [
        ToolStage::TemplateParse,
        ToolStage::TaskExecution,
        ToolStage::ChartGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStage::TemplateParse => "template_parse",
            ToolStage::TaskExecution => "task_execution",
            ToolStage::ChartGeneration => "chart_generation",
        }
    }
}

impl std::fmt::Display for ToolStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolStage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s.trim())
            .ok_or_else(|| format!("Unknown tool stage: {}", s))
    }
}

/// Why a tool call did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// A declared read was absent from the context.
    MissingInput,
    /// The tool returned an error.
    Execution,
    /// The tool panicked.
    Panicked,
    /// The caller's token fired.
    Cancelled,
    /// The stall detector gave up on the call.
    StallTimeout,
    /// The output could not be merged into the context.
    InvalidOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl std::fmt::Display for ToolErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Outcome of one tool call. Ephemeral: merged into the context and dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: Map<String, Value>,
    pub error: Option<ToolErrorInfo>,
}

impl ToolResult {
    pub fn ok(output: Map<String, Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Map::new(),
            error: Some(ToolErrorInfo {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// Stages in which the planner may use this tool.
    fn stages(&self) -> &[ToolStage];

    /// Context fields that must be present before the call.
    fn reads(&self) -> &[ContextField];

    /// Context fields the tool may write.
    fn writes(&self) -> &[ContextField];

    /// JSON schema for the tool's `input` map.
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    /// Execute the tool against a read-only view of the task's context.
    ///
    /// Returns a map keyed by context field name.
    async fn execute(
        &self,
        input: &Map<String, Value>,
        ctx: &TaskContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Map<String, Value>>;
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub stages: Vec<ToolStage>,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

/// Dependencies of the built-in tools.
#[derive(Clone)]
pub struct BuiltinTools {
    pub completer: Completer,
    pub queries: Arc<dyn QueryExecutor>,
    pub charts: Arc<dyn ChartRenderer>,
    pub max_result_rows: usize,
}

/// Registry of available tools.
///
/// Populated at startup, then shared read-only across workers.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry (no built-in tools).
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Create a registry holding the six built-in tools.
    pub fn with_builtins(deps: BuiltinTools) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(TimeWindowResolve));
        registry.register(Arc::new(SqlDraft::new(deps.completer.clone())));
        registry.register(Arc::new(SqlValidate));
        registry.register(Arc::new(SqlExecute::new(deps.queries, deps.max_result_rows)));
        registry.register(Arc::new(ChartBuild::new(deps.charts)));
        registry.register(Arc::new(Reasoning::new(deps.completer)));
        tracing::debug!("Created ToolRegistry with {} tools", registry.tools.len());
        registry
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!("Tool {} registered twice; keeping the latest", name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tools advertised in `stage`, sorted by name.
    pub fn for_stage(&self, stage: ToolStage) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self
            .tools
            .values()
            .filter(|t| t.stages().contains(&stage))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// List all tools, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                stages: t.stages().to_vec(),
                reads: t.reads().iter().map(|f| f.to_string()).collect(),
                writes: t.writes().iter().map(|f| f.to_string()).collect(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Execute a tool by name.
    ///
    /// Tool errors, panics, missing reads and cancellation all come back as
    /// `ToolResult { success: false }`. The output is filtered down to the
    /// tool's declared writes.
    ///
    /// # Errors
    /// `ToolNotFound` when no tool has this name.
    pub async fn execute(
        &self,
        name: &str,
        input: &Map<String, Value>,
        ctx: &TaskContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, AgentError> {
        let tool = self
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;

        if cancel.is_cancelled() {
            return Ok(ToolResult::failed(ToolErrorKind::Cancelled, "cancelled before start"));
        }

        let missing: Vec<&str> = tool
            .reads()
            .iter()
            .filter(|field| !ctx.has(**field))
            .map(|field| field.as_str())
            .collect();
        if !missing.is_empty() {
            return Ok(ToolResult::failed(
                ToolErrorKind::MissingInput,
                format!("missing context fields: {}", missing.join(", ")),
            ));
        }

        tracing::debug!(tool = %name, input = ?input, "Executing tool");

        let call = AssertUnwindSafe(tool.execute(input, ctx, cancel)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(ToolResult::failed(ToolErrorKind::Cancelled, "cancelled"));
            }
            outcome = call => outcome,
        };

        let result = match outcome {
            Err(panic) => ToolResult::failed(ToolErrorKind::Panicked, panic_message(panic.as_ref())),
            Ok(Err(e)) => ToolResult::failed(ToolErrorKind::Execution, format!("{:#}", e)),
            Ok(Ok(output)) => ToolResult::ok(filter_output(tool.as_ref(), output)),
        };

        if let Some(error) = &result.error {
            tracing::warn!(tool = %name, "Tool failed: {}", error);
        }
        Ok(result)
    }
}

/// Drop output keys the tool did not declare.
fn filter_output(tool: &dyn Tool, output: Map<String, Value>) -> Map<String, Value> {
    let writes = tool.writes();
    output
        .into_iter()
        .filter(|(key, _)| {
            let declared = key
                .parse::<ContextField>()
                .map(|f| writes.contains(&f))
                .unwrap_or(false);
            if !declared {
                tracing::debug!(tool = %tool.name(), key = %key, "Dropping undeclared tool output");
            }
            declared
        })
        .collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("tool panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("tool panicked: {}", s)
    } else {
        "tool panicked".to_string()
    }
}

/// Longest result cell quoted into a model prompt.
pub(crate) const MAX_CELL_CHARS: usize = 200;

/// A result cell as prompt text, capped at [`MAX_CELL_CHARS`].
pub(crate) fn cell_text(cell: &Value) -> String {
    match cell {
        Value::String(s) => crate::util::truncate_chars(s, MAX_CELL_CHARS),
        other => crate::util::truncate_chars(&other.to_string(), MAX_CELL_CHARS),
    }
}

/// Read an optional string field from a tool input map.
pub(crate) fn input_str<'a>(input: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Programmable tools for registry and pipeline tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// What a [`FakeTool`] does when called.
    #[derive(Clone)]
    pub(crate) enum Behavior {
        /// Return this output.
        Output(Value),
        /// Sleep, then return this output.
        Slow(Duration, Value),
        Fail(String),
        Panic,
        /// Never return.
        Hang,
        /// Hang on the first `n` calls, then return the output.
        HangTimes(usize, Value),
    }

    pub(crate) struct FakeTool {
        name: String,
        stages: Vec<ToolStage>,
        reads: Vec<ContextField>,
        writes: Vec<ContextField>,
        behavior: Behavior,
        pub(crate) calls: AtomicUsize,
    }

    impl FakeTool {
        pub(crate) fn new(name: &str, behavior: Behavior) -> Self {
            Self {
                name: name.to_string(),
                stages: ToolStage::ALL.to_vec(),
                reads: Vec::new(),
                writes: vec![
                    ContextField::CurrentSql,
                    ContextField::ExecutionResult,
                    ContextField::ChartSpec,
                    ContextField::ReportText,
                ],
                behavior,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_reads(mut self, reads: &[ContextField]) -> Self {
            self.reads = reads.to_vec();
            self
        }

        pub(crate) fn with_writes(mut self, writes: &[ContextField]) -> Self {
            self.writes = writes.to_vec();
            self
        }

        pub(crate) fn with_stages(mut self, stages: &[ToolStage]) -> Self {
            self.stages = stages.to_vec();
            self
        }
    }

    fn as_map(value: &Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "fake tool"
        }

        fn stages(&self) -> &[ToolStage] {
            &self.stages
        }

        fn reads(&self) -> &[ContextField] {
            &self.reads
        }

        fn writes(&self) -> &[ContextField] {
            &self.writes
        }

        async fn execute(
            &self,
            _input: &Map<String, Value>,
            _ctx: &TaskContext,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<Map<String, Value>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Output(v) => Ok(as_map(v)),
                Behavior::Slow(delay, v) => {
                    tokio::time::sleep(*delay).await;
                    Ok(as_map(v))
                }
                Behavior::Fail(message) => Err(anyhow::anyhow!(message.clone())),
                Behavior::Panic => panic!("fake tool exploded"),
                Behavior::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                Behavior::HangTimes(n, v) => {
                    if call < *n {
                        futures::future::pending::<()>().await;
                    }
                    Ok(as_map(v))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Behavior, FakeTool};
    use super::*;
    use crate::context::fixtures::orders_context;
    use crate::task::OutputKind;
    use std::time::Duration;

    fn registry(tools: Vec<FakeTool>) -> ToolRegistry {
        let mut registry = ToolRegistry::empty();
        for tool in tools {
            registry.register(Arc::new(tool));
        }
        registry
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::empty();
        let ctx = orders_context(OutputKind::Sql);
        let err = registry
            .execute("nope", &Map::new(), &ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolNotFound(name) if name == "nope"));
    }

    #[tokio::test]
    async fn failures_and_panics_become_results() {
        let registry = registry(vec![
            FakeTool::new("fails", Behavior::Fail("boom".to_string())),
            FakeTool::new("panics", Behavior::Panic),
        ]);
        let ctx = orders_context(OutputKind::Sql);
        let token = CancellationToken::new();

        let failed = registry
            .execute("fails", &Map::new(), &ctx, &token)
            .await
            .expect("result");
        assert!(!failed.success);
        assert_eq!(failed.error_kind(), Some(ToolErrorKind::Execution));
        assert!(failed.error_message().unwrap_or_default().contains("boom"));

        let panicked = registry
            .execute("panics", &Map::new(), &ctx, &token)
            .await
            .expect("result");
        assert_eq!(panicked.error_kind(), Some(ToolErrorKind::Panicked));
    }

    #[tokio::test]
    async fn missing_reads_fail_before_the_tool_runs() {
        let tool = FakeTool::new("needs_sql", Behavior::Output(json!({})))
            .with_reads(&[ContextField::CurrentSql]);
        let registry = registry(vec![tool]);
        let ctx = orders_context(OutputKind::Sql);

        let result = registry
            .execute("needs_sql", &Map::new(), &ctx, &CancellationToken::new())
            .await
            .expect("result");
        assert_eq!(result.error_kind(), Some(ToolErrorKind::MissingInput));
        assert!(result.error_message().unwrap_or_default().contains("current_sql"));
    }

    #[tokio::test]
    async fn undeclared_outputs_are_dropped() {
        let tool = FakeTool::new(
            "writer",
            Behavior::Output(json!({"current_sql": "SELECT 1", "chart_spec": {}, "extra": 1})),
        )
        .with_writes(&[ContextField::CurrentSql]);
        let registry = registry(vec![tool]);
        let ctx = orders_context(OutputKind::Sql);

        let result = registry
            .execute("writer", &Map::new(), &ctx, &CancellationToken::new())
            .await
            .expect("result");
        assert!(result.success);
        assert_eq!(result.output.len(), 1);
        assert_eq!(result.output["current_sql"], json!("SELECT 1"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_uncooperative_tools() {
        let registry = registry(vec![FakeTool::new("hangs", Behavior::Hang)]);
        let ctx = orders_context(OutputKind::Sql);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            registry.execute("hangs", &Map::new(), &ctx, &token),
        )
        .await
        .expect("registry must honour the token")
        .expect("result");
        assert_eq!(result.error_kind(), Some(ToolErrorKind::Cancelled));
    }

    #[test]
    fn stage_filter_is_sorted() {
        let registry = registry(vec![
            FakeTool::new("b", Behavior::Output(json!({}))).with_stages(&[ToolStage::TaskExecution]),
            FakeTool::new("a", Behavior::Output(json!({}))).with_stages(&[ToolStage::TaskExecution]),
            FakeTool::new("c", Behavior::Output(json!({}))).with_stages(&[ToolStage::ChartGeneration]),
        ]);
        let names: Vec<String> = registry
            .for_stage(ToolStage::TaskExecution)
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(
            "chart_generation".parse::<ToolStage>().expect("stage"),
            ToolStage::ChartGeneration
        );
    }
}
