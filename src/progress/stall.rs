//! Stall (ANR) detection for guarded calls.
//!
//! A [`StallGuard`] runs one background detector per task. Each model or
//! tool call goes through [`StallGuard::run_with`], which arms the detector
//! with a child cancellation token for that call. When the task's log has
//! been idle for longer than the threshold while a call is armed, the
//! detector appends a `stalled` event and cancels the call's token.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{EventStatus, ProgressUpdate, TaskEvents};
use crate::agents::AgentError;

const MIN_POLL: Duration = Duration::from_millis(50);

/// Why a guarded call did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The task token fired.
    Cancelled,
    /// The stall detector cancelled the call.
    Stalled,
}

struct ArmedCall {
    label: String,
    token: CancellationToken,
}

pub struct StallGuard {
    events: TaskEvents,
    threshold: Duration,
    task_token: CancellationToken,
    armed: Arc<Mutex<Option<ArmedCall>>>,
    detector: JoinHandle<()>,
}

impl StallGuard {
    /// Start the detector for one task. It stops when `task_token` fires or
    /// the guard is dropped.
    pub fn spawn(events: TaskEvents, threshold: Duration, task_token: CancellationToken) -> Self {
        let armed = Arc::new(Mutex::new(None));
        let detector = tokio::spawn(detect(
            events.clone(),
            threshold,
            task_token.clone(),
            Arc::clone(&armed),
        ));
        Self {
            events,
            threshold,
            task_token,
            armed,
            detector,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn events(&self) -> &TaskEvents {
        &self.events
    }

    pub fn is_cancelled(&self) -> bool {
        self.task_token.is_cancelled()
    }

    /// Run one guarded call.
    ///
    /// `call` receives the token it must hand to whatever it awaits; the
    /// guard also races the returned future against that token, so an
    /// uncooperative call is still abandoned.
    pub async fn run_with<T, F, Fut>(&self, label: &str, call: F) -> Result<T, Interrupt>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T>,
    {
        if self.task_token.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        let call_token = self.task_token.child_token();
        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = Some(ArmedCall {
            label: label.to_string(),
            token: call_token.clone(),
        });
        self.events.touch();

        let outcome = tokio::select! {
            biased;
            _ = call_token.cancelled() => None,
            value = call(call_token.clone()) => Some(value),
        };

        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.events.touch();

        match outcome {
            Some(value) => Ok(value),
            None if self.task_token.is_cancelled() => Err(Interrupt::Cancelled),
            None => Err(Interrupt::Stalled),
        }
    }
}

impl Drop for StallGuard {
    fn drop(&mut self) {
        self.detector.abort();
    }
}

async fn detect(
    events: TaskEvents,
    threshold: Duration,
    task_token: CancellationToken,
    armed: Arc<Mutex<Option<ArmedCall>>>,
) {
    let mut ticker = tokio::time::interval((threshold / 4).max(MIN_POLL));
    loop {
        tokio::select! {
            _ = task_token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let idle = match events.idle_for() {
            Some(idle) if idle >= threshold => idle,
            _ => continue,
        };
        let Some(call) = armed.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            continue;
        };

        tracing::warn!(
            task_id = %events.task_id(),
            label = %call.label,
            idle_ms = idle.as_millis() as u64,
            "Guarded call stalled; cancelling it"
        );
        let error = AgentError::StallTimeout {
            label: call.label.clone(),
            threshold,
        };
        events.emit(
            ProgressUpdate::new(
                EventStatus::Stalled,
                "stall",
                format!("No progress while running {}", call.label),
            )
            .with_error(error.to_string()),
        );
        call.token.cancel();
    }
}
