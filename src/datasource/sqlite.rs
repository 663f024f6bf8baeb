//! Reference SQLite data source: schema summaries and read-only queries.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::QueryExecutor;
use crate::context::{DataSourceEntry, ExecutionResult, SchemaProvider, SchemaSummary};

/// Registry of SQLite files keyed by data source id.
///
/// Every call opens its own read-only connection, so concurrent tasks never
/// share a connection.
#[derive(Debug, Clone, Default)]
pub struct SqliteDataSources {
    sources: HashMap<String, PathBuf>,
}

impl SqliteDataSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.sources.insert(id.into(), path.into());
        self
    }

    pub fn from_entries(entries: &[DataSourceEntry]) -> Self {
        entries.iter().fold(Self::new(), |acc, entry| {
            acc.with_source(entry.id.clone(), entry.path.clone())
        })
    }

    fn path_for(&self, data_source_id: &str) -> anyhow::Result<PathBuf> {
        self.sources
            .get(data_source_id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown data source: {}", data_source_id))
    }

    async fn open(path: PathBuf) -> anyhow::Result<Connection> {
        tokio::task::spawn_blocking(move || open_read_only(&path))
            .await
            .context("Task join error")?
    }
}

fn open_read_only(path: &Path) -> anyhow::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open SQLite database {}", path.display()))
}

fn read_schema(
    conn: &Connection,
    required_tables: Option<&[String]>,
) -> anyhow::Result<SchemaSummary> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut tables = BTreeMap::new();
    for name in names {
        if let Some(required) = required_tables {
            if !required.iter().any(|r| r.eq_ignore_ascii_case(&name)) {
                continue;
            }
        }
        let mut info = conn.prepare(&format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\"")))?;
        let columns = info
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        tables.insert(name, columns);
    }
    Ok(SchemaSummary::new(tables))
}

fn run_query(conn: &Connection, sql: &str, max_rows: usize) -> anyhow::Result<ExecutionResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if out.len() >= max_rows {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(json_value(row.get_ref(i)?));
        }
        out.push(values);
    }

    Ok(ExecutionResult {
        columns,
        rows: out,
        truncated,
    })
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

#[async_trait]
impl SchemaProvider for SqliteDataSources {
    async fn schema_summary(
        &self,
        data_source_id: &str,
        required_tables: Option<&[String]>,
    ) -> anyhow::Result<SchemaSummary> {
        let path = self.path_for(data_source_id)?;
        let required = required_tables.map(|t| t.to_vec());
        tokio::task::spawn_blocking(move || {
            let conn = open_read_only(&path)?;
            read_schema(&conn, required.as_deref())
        })
        .await
        .context("Task join error")?
    }
}

#[async_trait]
impl QueryExecutor for SqliteDataSources {
    async fn execute(
        &self,
        data_source_id: &str,
        sql: &str,
        max_rows: usize,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ExecutionResult> {
        let path = self.path_for(data_source_id)?;
        let conn = Self::open(path).await?;

        // SQLite checks the interrupt flag between VM steps, so a runaway
        // query stops even though it runs on a blocking thread.
        let interrupt = conn.get_interrupt_handle();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                interrupt.interrupt();
            })
        };

        let sql = sql.to_string();
        let result = tokio::task::spawn_blocking(move || run_query(&conn, &sql, max_rows)).await;
        watcher.abort();

        if cancel.is_cancelled() {
            return Err(anyhow!("Query cancelled"));
        }
        result.context("Task join error")?
    }
}
