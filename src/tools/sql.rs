//! SQL tools: draft with the model, check syntactically, execute read-only.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::{input_str, Tool, ToolStage};
use crate::context::{ContextField, SchemaSummary, TaskContext};
use crate::datasource::QueryExecutor;
use crate::llm::Completer;
use crate::util::extract_fenced_block;

/// Why a statement failed the cheap syntactic check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SqlCheckError {
    #[error("SQL is empty")]
    Empty,

    #[error("only SELECT / WITH queries are allowed, got `{0}`")]
    NotSelect(String),

    #[error("statement contains write keyword `{0}`")]
    NotReadOnly(String),

    #[error("more than one statement")]
    MultipleStatements,

    #[error("unbalanced {0}")]
    Unbalanced(&'static str),

    #[error("unknown table `{0}`")]
    UnknownTable(String),
}

fn write_keywords() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(insert|update|delete|drop|alter|create|attach|detach|pragma|vacuum|reindex|truncate|grant|revoke)\b",
        )
        .expect("valid regex")
    })
}

fn table_refs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b(?:from|join)\s+("[^"]+"|`[^`]+`|[A-Za-z_][A-Za-z0-9_\.]*)"#)
            .expect("valid regex")
    })
}

fn cte_names() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:\bwith\s+(?:recursive\s+)?|,\s*)([A-Za-z_][A-Za-z0-9_]*)\s+as\s*\(")
            .expect("valid regex")
    })
}

/// Trim whitespace and trailing semicolons.
fn normalize(sql: &str) -> String {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace()).to_string()
}

/// Blank out string literals and comments so keyword checks only see code.
fn strip_literals(sql: &str) -> Result<String, SqlCheckError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        if c == '\'' {
            // '' is an escaped quote inside a literal
            let mut j = i + 1;
            loop {
                match chars.get(j) {
                    None => return Err(SqlCheckError::Unbalanced("quote")),
                    Some('\'') if chars.get(j + 1) == Some(&'\'') => j += 2,
                    Some('\'') => break,
                    Some(_) => j += 1,
                }
            }
            out.push_str("''");
            i = j + 1;
        } else if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            out.push(' ');
        } else if c == '/' && next == Some('*') {
            let mut j = i + 2;
            loop {
                if j + 1 >= chars.len() {
                    return Err(SqlCheckError::Unbalanced("comment"));
                }
                if chars[j] == '*' && chars[j + 1] == '/' {
                    break;
                }
                j += 1;
            }
            out.push(' ');
            i = j + 2;
        } else {
            out.push(c);
            i += 1;
        }
    }
    Ok(out)
}

/// Cheap syntactic check for a single read-only query.
///
/// Returns the normalized statement (trimmed, no trailing semicolon).
pub fn check_sql_syntax(sql: &str) -> Result<String, SqlCheckError> {
    let normalized = normalize(sql);
    if normalized.is_empty() {
        return Err(SqlCheckError::Empty);
    }
    let code = strip_literals(&normalized)?;

    if code.contains(';') {
        return Err(SqlCheckError::MultipleStatements);
    }
    if code.matches('"').count() % 2 != 0 || code.matches('`').count() % 2 != 0 {
        return Err(SqlCheckError::Unbalanced("identifier quote"));
    }
    let mut depth: i64 = 0;
    for c in code.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SqlCheckError::Unbalanced("parenthesis"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SqlCheckError::Unbalanced("parenthesis"));
    }

    let first = code
        .split(|c: char| c.is_whitespace() || c == '(')
        .find(|w| !w.is_empty())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if first != "select" && first != "with" {
        return Err(SqlCheckError::NotSelect(first));
    }
    if let Some(m) = write_keywords().find(&code) {
        return Err(SqlCheckError::NotReadOnly(m.as_str().to_ascii_uppercase()));
    }

    Ok(normalized)
}

/// Check that every table referenced after FROM / JOIN exists in `schema`.
///
/// CTE names are allowed. A truncated schema cannot prove a table is
/// missing, so the check passes in that case.
pub fn check_sql_tables(sql: &str, schema: &SchemaSummary) -> Result<(), SqlCheckError> {
    if !schema.is_complete() {
        return Ok(());
    }
    let code = strip_literals(sql)?;

    let ctes: HashSet<String> = cte_names()
        .captures_iter(&code)
        .map(|c| c[1].to_ascii_lowercase())
        .collect();
    let columns: HashSet<String> = schema
        .columns_by_table
        .values()
        .flatten()
        .map(|c| c.to_ascii_lowercase())
        .collect();

    for capture in table_refs().captures_iter(&code) {
        let raw = capture[1].trim_matches(|c| c == '"' || c == '`');
        let name = raw.rsplit('.').next().unwrap_or(raw);
        let lower = name.to_ascii_lowercase();
        // `EXTRACT(YEAR FROM created_at)` style expressions name a column.
        if ctes.contains(&lower) || columns.contains(&lower) {
            continue;
        }
        if schema.find_table(name).is_none() {
            return Err(SqlCheckError::UnknownTable(name.to_string()));
        }
    }
    Ok(())
}

/// Pull the statement out of a model reply.
fn extract_sql(response: &str) -> String {
    let body = extract_fenced_block(response, &["sql", "sqlite", ""]).unwrap_or(response);
    normalize(body)
}

/// Drafts a query for the placeholder with the model.
pub struct SqlDraft {
    completer: Completer,
}

impl SqlDraft {
    pub fn new(completer: Completer) -> Self {
        Self { completer }
    }

    fn prompt(input: &Map<String, Value>, ctx: &TaskContext) -> String {
        let mut prompt = format!(
            "{}\n\nSchema:\n{}",
            ctx.describe(),
            ctx.schema.render()
        );
        if let Some(sql) = &ctx.current_sql {
            prompt.push_str(&format!("\nPrevious draft:\n{}\n", sql));
        }
        if let Some(hint) = input_str(input, "hint") {
            prompt.push_str(&format!("\nHint: {}\n", hint));
        }
        if let Some(feedback) = input_str(input, "feedback") {
            prompt.push_str(&format!("\nFix this problem: {}\n", feedback));
        }
        prompt.push_str(
            "\nWrite one read-only SQLite SELECT statement that computes the placeholder. \
             Use only the tables and columns listed above. \
             Reply with the statement in a ```sql fenced block and nothing else.",
        );
        prompt
    }
}

#[async_trait]
impl Tool for SqlDraft {
    fn name(&self) -> &str {
        "sql.draft"
    }

    fn description(&self) -> &str {
        "Draft a SELECT statement for the placeholder from the schema and task description."
    }

    fn stages(&self) -> &[ToolStage] {
        &[ToolStage::TemplateParse, ToolStage::TaskExecution]
    }

    fn reads(&self) -> &[ContextField] {
        &[ContextField::Schema, ContextField::Placeholder]
    }

    fn writes(&self) -> &[ContextField] {
        &[ContextField::CurrentSql]
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "hint": {"type": "string", "description": "Extra guidance for the query"},
                "feedback": {"type": "string", "description": "Problem to fix in the previous draft"}
            }
        })
    }

    async fn execute(
        &self,
        input: &Map<String, Value>,
        ctx: &TaskContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Map<String, Value>> {
        let response = self
            .completer
            .complete(
                Some("You are a careful analytics engineer. You write SQLite SQL."),
                &Self::prompt(input, ctx),
            )
            .await?;
        let sql = extract_sql(&response);
        if sql.is_empty() {
            anyhow::bail!("model returned no SQL");
        }
        tracing::debug!(sql = %sql, "Drafted SQL");

        let mut out = Map::new();
        out.insert(ContextField::CurrentSql.to_string(), Value::String(sql));
        Ok(out)
    }
}

/// Syntactic and schema check of `current_sql`; writes back the normalized
/// statement.
pub struct SqlValidate;

#[async_trait]
impl Tool for SqlValidate {
    fn name(&self) -> &str {
        "sql.validate"
    }

    fn description(&self) -> &str {
        "Check the current SQL: single read-only SELECT, balanced, known tables."
    }

    fn stages(&self) -> &[ToolStage] {
        &[ToolStage::TemplateParse, ToolStage::TaskExecution]
    }

    fn reads(&self) -> &[ContextField] {
        &[ContextField::CurrentSql, ContextField::Schema]
    }

    fn writes(&self) -> &[ContextField] {
        &[ContextField::CurrentSql]
    }

    async fn execute(
        &self,
        _input: &Map<String, Value>,
        ctx: &TaskContext,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<Map<String, Value>> {
        let sql = ctx.current_sql.as_deref().unwrap_or_default();
        let normalized = check_sql_syntax(sql)?;
        check_sql_tables(&normalized, &ctx.schema)?;

        let mut out = Map::new();
        out.insert(ContextField::CurrentSql.to_string(), Value::String(normalized));
        Ok(out)
    }
}

/// Runs `current_sql` through the query executor.
pub struct SqlExecute {
    queries: Arc<dyn QueryExecutor>,
    max_rows: usize,
}

impl SqlExecute {
    pub fn new(queries: Arc<dyn QueryExecutor>, max_rows: usize) -> Self {
        Self {
            queries,
            max_rows: max_rows.max(1),
        }
    }
}

#[async_trait]
impl Tool for SqlExecute {
    fn name(&self) -> &str {
        "sql.execute"
    }

    fn description(&self) -> &str {
        "Run the current SQL against the data source and capture the rows."
    }

    fn stages(&self) -> &[ToolStage] {
        &[ToolStage::TaskExecution, ToolStage::ChartGeneration]
    }

    fn reads(&self) -> &[ContextField] {
        &[ContextField::CurrentSql]
    }

    fn writes(&self) -> &[ContextField] {
        &[ContextField::ExecutionResult]
    }

    async fn execute(
        &self,
        _input: &Map<String, Value>,
        ctx: &TaskContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Map<String, Value>> {
        let sql = check_sql_syntax(ctx.current_sql.as_deref().unwrap_or_default())?;
        let result = self
            .queries
            .execute(&ctx.data_source_id, &sql, self.max_rows, cancel)
            .await?;
        tracing::debug!(
            rows = result.row_count(),
            truncated = result.truncated,
            "Query executed"
        );

        let mut out = Map::new();
        out.insert(
            ContextField::ExecutionResult.to_string(),
            serde_json::to_value(&result)?,
        );
        Ok(out)
    }
}
