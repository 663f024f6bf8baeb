//! The task orchestrator: submission, the worker pool, status, cancellation.
//!
//! Each submitted task runs one Plan -> Tool -> Observe -> Finalize loop on a
//! pooled tokio task (see `pipeline`). The task table and the tracker's logs
//! are the shared state; whenever both are needed the task table is locked
//! first. Finished tasks leave both after `retention`, or sooner when more
//! than `max_retained` have piled up; the task store keeps their record.

mod pipeline;
mod policy;

pub use policy::FatalToolPolicy;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentError, Finalizer, Planner, StepExecutor};
use crate::bus::{MessageBus, Subscription, Topic};
use crate::context::{
    ContextBuilder, ContextLimits, PlaceholderInfo, PlaceholderProvider, ScheduleProvider,
    SchemaProvider, TimeWindowSpec,
};
use crate::llm::Completer;
use crate::progress::{EventStatus, ProgressEvent, ProgressTracker, ProgressUpdate};
use crate::store::{spawn_recorder, TaskRun, TaskStore};
use crate::task::{Decision, OutputKind, Task, TaskId, TaskStatus};
use crate::tools::{ToolRegistry, ToolStage};

/// Tuning knobs of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Tasks running at the same time.
    pub worker_count: usize,
    /// Idle time after which a guarded call counts as stalled.
    pub stall_threshold: Duration,
    /// Extra attempts for a stalled tool step.
    pub stall_retries: u32,
    /// Planning attempts per round before the task fails.
    pub plan_max_attempts: u32,
    pub max_plan_steps: usize,
    pub context_limits: ContextLimits,
    pub fatal_tools: FatalToolPolicy,
    /// How long a finished task stays in the task table.
    pub retention: Duration,
    /// Finished tasks kept in the task table at most.
    pub max_retained: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            stall_threshold: Duration::from_secs(60),
            stall_retries: 1,
            plan_max_attempts: 3,
            max_plan_steps: 8,
            context_limits: ContextLimits::default(),
            fatal_tools: FatalToolPolicy::default(),
            retention: Duration::from_secs(600),
            max_retained: 1_000,
        }
    }
}

/// A task as submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_description: String,
    pub output_kind: OutputKind,
    pub data_source_id: String,
    /// Inline placeholder; otherwise looked up by template/placeholder id.
    #[serde(default)]
    pub placeholder: Option<PlaceholderInfo>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub placeholder_id: Option<String>,
    /// Schedule to resolve the time window from, unless `time_window` is given.
    #[serde(default)]
    pub schedule_ref: Option<String>,
    #[serde(default)]
    pub time_window: Option<TimeWindowSpec>,
    #[serde(default)]
    pub required_tables: Option<Vec<String>>,
    /// Run a single round in this stage instead of the kind's default rounds.
    #[serde(default)]
    pub stage: Option<ToolStage>,
}

impl TaskRequest {
    pub fn new(
        task_description: impl Into<String>,
        output_kind: OutputKind,
        data_source_id: impl Into<String>,
    ) -> Self {
        Self {
            task_description: task_description.into(),
            output_kind,
            data_source_id: data_source_id.into(),
            placeholder: None,
            template_id: None,
            placeholder_id: None,
            schedule_ref: None,
            time_window: None,
            required_tables: None,
            stage: None,
        }
    }

    pub fn with_placeholder(mut self, placeholder: PlaceholderInfo) -> Self {
        self.placeholder = Some(placeholder);
        self
    }
}

/// External capabilities used to build contexts.
#[derive(Clone)]
pub struct Providers {
    pub schema: Arc<dyn SchemaProvider>,
    pub placeholder: Option<Arc<dyn PlaceholderProvider>>,
    pub schedule: Option<Arc<dyn ScheduleProvider>>,
}

/// Snapshot returned by [`Orchestrator::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<TaskRun> for TaskStatusView {
    fn from(run: TaskRun) -> Self {
        let error = match (&run.status, &run.decision) {
            (TaskStatus::Failed, Some(decision)) => Some(decision.reasoning.clone()),
            _ => None,
        };
        Self {
            task_id: run.task_id,
            status: run.status,
            progress_percent: run.progress_percent,
            current_step: run.current_step,
            decision: run.decision,
            error,
        }
    }
}

struct TaskEntry {
    task: Task,
    token: CancellationToken,
    done: watch::Sender<bool>,
}

struct Inner {
    config: OrchestratorConfig,
    registry: Arc<ToolRegistry>,
    builder: ContextBuilder,
    planner: Planner,
    executor: StepExecutor,
    finalizer: Finalizer,
    providers: Providers,
    bus: MessageBus,
    tracker: ProgressTracker,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    workers: Arc<Semaphore>,
    store: OnceLock<Arc<dyn TaskStore>>,
}

/// Cheap to clone; clones share the same task table and worker pool.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        completer: Completer,
        registry: ToolRegistry,
        providers: Providers,
    ) -> Self {
        let registry = Arc::new(registry);
        let bus = MessageBus::new();
        let inner = Inner {
            builder: ContextBuilder::new(config.context_limits.clone()),
            planner: Planner::new(completer.clone(), config.max_plan_steps),
            executor: StepExecutor::new(Arc::clone(&registry), config.stall_retries),
            finalizer: Finalizer::new(completer),
            workers: Arc::new(Semaphore::new(config.worker_count.max(1))),
            tracker: ProgressTracker::new(bus.clone()),
            bus,
            registry,
            providers,
            tasks: Mutex::new(HashMap::new()),
            store: OnceLock::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Record every run and event in `store`.
    ///
    /// Must be called from within a tokio runtime, before any submission.
    /// Only the first store attached is used.
    pub fn with_store(self, store: Arc<dyn TaskStore>) -> Self {
        if self.inner.store.set(Arc::clone(&store)).is_ok() {
            spawn_recorder(&self.inner.bus, store);
        } else {
            tracing::warn!("Task store already attached; ignoring the new one");
        }
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    /// Accept a task and start it asynchronously.
    ///
    /// # Errors
    /// `Task(EmptyDescription)` for a blank description.
    pub async fn submit_task(&self, request: TaskRequest) -> Result<TaskId, AgentError> {
        let task = Task::new(request.task_description.clone(), request.output_kind)?;
        let id = task.id();

        if let Some(store) = self.inner.store.get() {
            if let Err(e) = store
                .create_run(TaskRun::new(id, task.description(), task.output_kind()))
                .await
            {
                tracing::warn!(task_id = %id, "Failed to record task run: {}", e);
            }
        }

        let token = CancellationToken::new();
        let (done, _) = watch::channel(false);
        {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.insert(
                id,
                TaskEntry {
                    task,
                    token: token.clone(),
                    done,
                },
            );
            self.inner.tracker.open(id);
            self.inner.tracker.emit(
                id,
                ProgressUpdate::new(EventStatus::Pending, "queued", "Task queued").with_percent(0.0),
            );
        }

        tracing::info!(
            task_id = %id,
            output_kind = %request.output_kind,
            "Task submitted: {}",
            request.task_description
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.execute(id, request, token).await;
            tokio::time::sleep(inner.config.retention).await;
            inner.evict(id);
        });

        Ok(id)
    }

    /// Status of a task: live while it is in the task table, then as
    /// recorded by the task store.
    pub async fn get_status(&self, task_id: TaskId) -> Option<TaskStatusView> {
        if let Some(view) = self.live_status(task_id) {
            return Some(view);
        }
        let store = self.inner.store.get()?;
        match store.get_run(task_id).await {
            Ok(run) => run.map(TaskStatusView::from),
            Err(e) => {
                tracing::warn!(task_id = %task_id, "Failed to read task run: {}", e);
                None
            }
        }
    }

    fn live_status(&self, task_id: TaskId) -> Option<TaskStatusView> {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = tasks.get(&task_id)?;
        let (progress_percent, current_step) = self
            .inner
            .tracker
            .progress(task_id)
            .unwrap_or((0.0, None));
        let status = entry.task.status();
        let error = if status == TaskStatus::Failed {
            self.inner
                .tracker
                .last_event(task_id)
                .and_then(|event| event.error)
        } else {
            None
        };
        Some(TaskStatusView {
            task_id,
            status,
            progress_percent,
            current_step,
            decision: entry.task.decision().cloned(),
            error,
        })
    }

    /// Every task in the task table, oldest first.
    pub fn list_tasks(&self) -> Vec<TaskStatusView> {
        let mut ids: Vec<(chrono::DateTime<chrono::Utc>, TaskId)> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| (entry.task.created_at(), entry.task.id()))
            .collect();
        ids.sort_by_key(|(created_at, _)| *created_at);
        ids.into_iter()
            .filter_map(|(_, id)| self.live_status(id))
            .collect()
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.inner.bus.subscribe(topic)
    }

    /// The task's event log so far; empty once the task was evicted.
    pub fn events(&self, task_id: TaskId) -> Vec<ProgressEvent> {
        self.inner.tracker.events(task_id)
    }

    /// Cancel a task.
    ///
    /// Idempotent: returns `true` whenever the task ends up `Cancelled`,
    /// `false` for unknown tasks and tasks that already completed or failed.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = tasks.get_mut(&task_id) else {
            return false;
        };
        match entry.task.status() {
            TaskStatus::Cancelled => return true,
            status if status.is_terminal() => return false,
            _ => {}
        }
        if let Err(e) = entry.task.cancel() {
            tracing::error!(task_id = %task_id, "Cancel rejected: {}", e);
            return false;
        }
        entry.token.cancel();
        self.inner.tracker.emit(
            task_id,
            ProgressUpdate::new(EventStatus::Cancelled, "cancelled", "Task cancelled"),
        );
        entry.done.send_replace(true);
        let released = self.inner.bus.unsubscribe_task(task_id);
        tracing::info!(task_id = %task_id, released, "Task cancelled");
        self.inner.enforce_cap(&mut tasks);
        true
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait(&self, task_id: TaskId) -> Option<TaskStatusView> {
        let done = {
            let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.get(&task_id).map(|entry| entry.done.subscribe())
        };
        if let Some(mut done) = done {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.get_status(task_id).await
    }
}

impl Inner {
    /// Wait for a worker slot and run the task, unless it is cancelled first.
    async fn execute(&self, task_id: TaskId, request: TaskRequest, token: CancellationToken) {
        let permit = tokio::select! {
            _ = token.cancelled() => return,
            permit = Arc::clone(&self.workers).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return;
        };

        let run = AssertUnwindSafe(self.run_task(task_id, request, token)).catch_unwind();
        if let Err(panic) = run.await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(task_id = %task_id, "Task run panicked: {}", message);
            self.finish(task_id, Decision::failure(format!("task run panicked: {}", message)));
        }
    }

    /// Drop a finished task's entry and event log. Live tasks are kept.
    fn evict(&self, task_id: TaskId) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let live = tasks
            .get(&task_id)
            .is_some_and(|entry| !entry.task.status().is_terminal());
        if live {
            return;
        }
        tasks.remove(&task_id);
        if self.tracker.forget(task_id) {
            tracing::debug!(task_id = %task_id, "Evicted finished task");
        }
    }

    /// Evict the longest-finished tasks beyond `max_retained`.
    fn enforce_cap(&self, tasks: &mut HashMap<TaskId, TaskEntry>) {
        let mut finished: Vec<(chrono::DateTime<chrono::Utc>, TaskId)> = tasks
            .values()
            .filter_map(|entry| entry.task.ended_at().map(|at| (at, entry.task.id())))
            .collect();
        if finished.len() <= self.config.max_retained {
            return;
        }
        finished.sort_by_key(|(ended_at, _)| *ended_at);
        let excess = finished.len() - self.config.max_retained;
        for (_, id) in finished.into_iter().take(excess) {
            tasks.remove(&id);
            self.tracker.forget(id);
        }
        tracing::debug!(evicted = excess, "Finished task cap reached");
    }

    /// Move a live task to `next` and emit `update`.
    ///
    /// Returns `Cancelled` if the task already reached a terminal state.
    fn transition(
        &self,
        task_id: TaskId,
        next: TaskStatus,
        update: ProgressUpdate,
    ) -> Result<(), AgentError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let entry = tasks.get_mut(&task_id).ok_or(AgentError::Cancelled)?;
        if entry.task.status().is_terminal() {
            return Err(AgentError::Cancelled);
        }
        entry.task.advance(next)?;
        self.tracker.emit(task_id, update);
        Ok(())
    }

    /// Record the terminal decision, emit the terminal event and release
    /// the task's subscriptions. A no-op once the task is terminal.
    fn finish(&self, task_id: TaskId, decision: Decision) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = tasks.get_mut(&task_id) else {
            return false;
        };
        if entry.task.status().is_terminal() {
            return false;
        }
        let status = match entry.task.finish(decision.clone()) {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(task_id = %task_id, "Cannot record decision: {}", e);
                return false;
            }
        };

        let mut update = ProgressUpdate::new(
            EventStatus::from(status),
            "finalize",
            if decision.success {
                "Task completed"
            } else {
                "Task failed"
            },
        )
        .with_decision(decision.clone());
        if decision.success {
            update = update.with_percent(100.0);
        } else {
            update = update.with_error(decision.reasoning.clone());
        }
        self.tracker.emit(task_id, update);
        entry.done.send_replace(true);
        self.bus.unsubscribe_task(task_id);

        tracing::info!(
            task_id = %task_id,
            status = %status,
            quality = decision.quality_score,
            "Task finished"
        );
        self.enforce_cap(&mut tasks);
        true
    }
}
