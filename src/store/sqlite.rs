//! SQLite-based task store with full event logging.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::{TaskRun, TaskStore};
use crate::progress::ProgressEvent;
use crate::task::{OutputKind, TaskId, TaskStatus};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS task_runs (
    task_id TEXT PRIMARY KEY NOT NULL,
    description TEXT NOT NULL,
    output_kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    progress_percent REAL NOT NULL DEFAULT 0,
    current_step TEXT,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    ended_at TEXT,
    decision TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_started_at ON task_runs(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_status ON task_runs(status);

CREATE TABLE IF NOT EXISTS task_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL,
    stage TEXT NOT NULL,
    progress_percent REAL NOT NULL,
    message TEXT NOT NULL,
    error TEXT,
    payload TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_events_task ON task_events(task_id, sequence);
CREATE INDEX IF NOT EXISTS idx_events_status ON task_events(task_id, status);
"#;

const RUN_COLUMNS: &str = "task_id, description, output_kind, status, progress_percent, \
    current_step, started_at, updated_at, ended_at, decision";

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create task store dir: {}", e))?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let decision_json: Option<String> = row.get(9)?;

    Ok(TaskRun {
        task_id: id_str.parse().unwrap_or_default(),
        description: row.get(1)?,
        output_kind: kind_str.parse().unwrap_or(OutputKind::Report),
        status: status_str.parse().unwrap_or(TaskStatus::Failed),
        progress_percent: row.get(4)?,
        current_step: row.get(5)?,
        started_at: row.get(6)?,
        updated_at: row.get(7)?,
        ended_at: row.get(8)?,
        decision: decision_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn load_run(conn: &Connection, task_id: &str) -> Result<Option<TaskRun>, String> {
    conn.query_row(
        &format!("SELECT {} FROM task_runs WHERE task_id = ?1", RUN_COLUMNS),
        params![task_id],
        row_to_run,
    )
    .optional()
    .map_err(|e| e.to_string())
}

fn save_run(conn: &Connection, run: &TaskRun) -> Result<(), String> {
    let decision = run
        .decision
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| e.to_string())?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO task_runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            RUN_COLUMNS
        ),
        params![
            run.task_id.to_string(),
            run.description,
            run.output_kind.as_str(),
            run.status.as_str(),
            run.progress_percent,
            run.current_step,
            run.started_at,
            run.updated_at,
            run.ended_at,
            decision,
        ],
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_run(&self, run: TaskRun) -> Result<(), String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            save_run(&conn, &run)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn apply_event(&self, event: &ProgressEvent) -> Result<(), String> {
        let conn = self.conn.clone();
        let event = event.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let id_str = event.task_id.to_string();
            let payload = serde_json::to_string(&event).map_err(|e| e.to_string())?;

            conn.execute(
                "INSERT OR IGNORE INTO task_events
                    (task_id, sequence, timestamp, status, stage, progress_percent, message, error, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id_str,
                    event.sequence as i64,
                    event.timestamp.to_rfc3339(),
                    event.status.as_str(),
                    event.stage,
                    event.progress_percent,
                    event.message,
                    event.error,
                    payload,
                ],
            )
            .map_err(|e| e.to_string())?;

            if let Some(mut run) = load_run(&conn, &id_str)? {
                run.apply(&event);
                save_run(&conn, &run)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn get_run(&self, task_id: TaskId) -> Result<Option<TaskRun>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            load_run(&conn, &task_id.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn list_runs(&self, limit: usize, offset: usize) -> Result<Vec<TaskRun>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM task_runs ORDER BY started_at DESC LIMIT ?1 OFFSET ?2",
                    RUN_COLUMNS
                ))
                .map_err(|e| e.to_string())?;
            let runs = stmt
                .query_map(params![limit as i64, offset as i64], row_to_run)
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(runs)
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn events(&self, task_id: TaskId) -> Result<Vec<ProgressEvent>, String> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare("SELECT payload FROM task_events WHERE task_id = ?1 ORDER BY sequence")
                .map_err(|e| e.to_string())?;
            let payloads = stmt
                .query_map(params![task_id.to_string()], |row| row.get::<_, String>(0))
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;

            let mut events = Vec::with_capacity(payloads.len());
            for payload in payloads {
                match serde_json::from_str(&payload) {
                    Ok(event) => events.push(event),
                    Err(e) => tracing::warn!("Skipping unreadable stored event: {}", e),
                }
            }
            Ok(events)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{EventStatus, ProgressUpdate};
    use crate::task::Decision;
    use chrono::Utc;

    #[tokio::test]
    async fn persists_runs_and_events_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs.db");
        let id = TaskId::new();

        {
            let store = SqliteTaskStore::new(path.clone()).await.expect("open");
            store
                .create_run(TaskRun::new(id, "compute refunds", OutputKind::Sql))
                .await
                .expect("create");
            let updates = [
                ProgressUpdate::new(EventStatus::Planning, "task_execution", "planning"),
                ProgressUpdate::new(EventStatus::Completed, "finalize", "done")
                    .with_percent(100.0)
                    .with_decision(Decision::new(true, "SELECT 1", "ok", 0.9)),
            ];
            for (i, update) in updates.into_iter().enumerate() {
                let percent = update.progress_percent.unwrap_or(0.0);
                let event = ProgressEvent::from_update(id, i as u64 + 1, percent, update, Utc::now());
                store.apply_event(&event).await.expect("apply");
                // Replays are ignored.
                store.apply_event(&event).await.expect("apply");
            }
        }

        let store = SqliteTaskStore::new(path).await.expect("reopen");
        let run = store.get_run(id).await.expect("get").expect("run");
        assert_eq!(run.status, TaskStatus::Completed);
        assert_eq!(run.progress_percent, 100.0);
        assert_eq!(run.decision.map(|d| d.quality_score), Some(0.9));

        let events = store.events(id).await.expect("events");
        assert_eq!(
            events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(store.list_runs(10, 0).await.expect("list").len(), 1);
    }
}
