//! Per-task event logs and activity clocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use super::{Observation, ProgressEvent, ProgressUpdate};
use crate::bus::MessageBus;
use crate::task::TaskId;

struct TaskLog {
    events: Vec<ProgressEvent>,
    last_activity: Instant,
    closed: bool,
    next_sequence: u64,
    percent: f64,
    current_step: Option<String>,
}

impl TaskLog {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            last_activity: Instant::now(),
            closed: false,
            next_sequence: 1,
            percent: 0.0,
            current_step: None,
        }
    }
}

/// Owns every task's event log and publishes each appended event.
///
/// # Invariants
/// - sequences are strictly increasing per task, starting at 1
/// - publishing happens under the log lock, so bus order equals log order
/// - after a terminal event the log is closed and further emits are no-ops
/// - events for tasks without an open log (never opened or forgotten) are
///   dropped
#[derive(Clone)]
pub struct ProgressTracker {
    bus: MessageBus,
    logs: Arc<Mutex<HashMap<TaskId, TaskLog>>>,
}

impl ProgressTracker {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            logs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Start a log for `task_id`. Re-opening an existing log is a no-op.
    pub fn open(&self, task_id: TaskId) {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(task_id)
            .or_insert_with(TaskLog::new);
    }

    /// Drop the log of `task_id`.
    pub fn forget(&self, task_id: TaskId) -> bool {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id)
            .is_some()
    }

    /// Append an event and publish it.
    ///
    /// Returns `None` when the log is closed or missing.
    pub fn emit(&self, task_id: TaskId, update: ProgressUpdate) -> Option<ProgressEvent> {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(log) = logs.get_mut(&task_id) else {
            tracing::debug!(
                task_id = %task_id,
                status = %update.status,
                "Dropping event for unknown task"
            );
            return None;
        };
        if log.closed {
            tracing::debug!(
                task_id = %task_id,
                status = %update.status,
                "Dropping event for finished task"
            );
            return None;
        }

        if let Some(percent) = update.progress_percent {
            log.percent = percent;
        }
        if let Some(label) = &update.current_step {
            log.current_step = Some(label.clone());
        }
        let terminal = update.status.is_terminal();
        let event = ProgressEvent::from_update(
            task_id,
            log.next_sequence,
            log.percent,
            update,
            Utc::now(),
        );
        log.next_sequence += 1;
        log.last_activity = Instant::now();
        log.closed = terminal;
        log.events.push(event.clone());

        tracing::debug!(
            task_id = %task_id,
            sequence = event.sequence,
            status = %event.status,
            percent = event.progress_percent,
            "{}",
            event.message
        );
        self.bus.publish(&event);
        Some(event)
    }

    /// Record activity without emitting an event.
    pub fn touch(&self, task_id: TaskId) {
        if let Some(log) = self
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&task_id)
        {
            log.last_activity = Instant::now();
        }
    }

    /// Time since the last event or touch.
    pub fn idle_for(&self, task_id: TaskId) -> Option<Duration> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .map(|log| log.last_activity.elapsed())
    }

    pub fn is_closed(&self, task_id: TaskId) -> bool {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .map(|log| log.closed)
            .unwrap_or(false)
    }

    pub fn events(&self, task_id: TaskId) -> Vec<ProgressEvent> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }

    pub fn last_event(&self, task_id: TaskId) -> Option<ProgressEvent> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .and_then(|log| log.events.last().cloned())
    }

    /// Last reported percent and current step label.
    pub fn progress(&self, task_id: TaskId) -> Option<(f64, Option<String>)> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .map(|log| (log.percent, log.current_step.clone()))
    }

    pub fn observation(&self, task_id: TaskId) -> Observation {
        Observation::from_events(&self.events(task_id))
    }

    pub fn for_task(&self, task_id: TaskId) -> TaskEvents {
        self.open(task_id);
        TaskEvents {
            task_id,
            tracker: self.clone(),
        }
    }
}

/// A [`ProgressTracker`] handle bound to one task.
#[derive(Clone)]
pub struct TaskEvents {
    task_id: TaskId,
    tracker: ProgressTracker,
}

impl TaskEvents {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn emit(&self, update: ProgressUpdate) -> Option<ProgressEvent> {
        self.tracker.emit(self.task_id, update)
    }

    pub fn touch(&self) {
        self.tracker.touch(self.task_id)
    }

    pub fn idle_for(&self) -> Option<Duration> {
        self.tracker.idle_for(self.task_id)
    }

    pub fn observation(&self) -> Observation {
        self.tracker.observation(self.task_id)
    }
}
