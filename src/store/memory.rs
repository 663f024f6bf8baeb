//! In-memory task store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{TaskRun, TaskStore};
use crate::progress::ProgressEvent;
use crate::task::TaskId;

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    runs: Arc<RwLock<HashMap<TaskId, TaskRun>>>,
    events: Arc<RwLock<HashMap<TaskId, Vec<ProgressEvent>>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_run(&self, run: TaskRun) -> Result<(), String> {
        self.runs.write().await.insert(run.task_id, run);
        Ok(())
    }

    async fn apply_event(&self, event: &ProgressEvent) -> Result<(), String> {
        self.events
            .write()
            .await
            .entry(event.task_id)
            .or_default()
            .push(event.clone());
        if let Some(run) = self.runs.write().await.get_mut(&event.task_id) {
            run.apply(event);
        }
        Ok(())
    }

    async fn get_run(&self, task_id: TaskId) -> Result<Option<TaskRun>, String> {
        Ok(self.runs.read().await.get(&task_id).cloned())
    }

    async fn list_runs(&self, limit: usize, offset: usize) -> Result<Vec<TaskRun>, String> {
        let mut runs: Vec<TaskRun> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs.into_iter().skip(offset).take(limit).collect())
    }

    async fn events(&self, task_id: TaskId) -> Result<Vec<ProgressEvent>, String> {
        let mut events = self
            .events
            .read()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }
}
