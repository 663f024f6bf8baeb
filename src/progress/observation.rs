use serde::Serialize;

use super::{EventStatus, ProgressEvent};

/// What the finalizer sees of a run, folded purely from the event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Observation {
    pub steps_attempted: usize,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    /// Tool names of finished steps, in completion order.
    pub completion_log: Vec<String>,
    pub current_sql: Option<String>,
    pub row_count: Option<usize>,
    pub has_chart: bool,
    pub stall_count: usize,
    pub errors: Vec<String>,
}

impl Observation {
    pub fn from_events(events: &[ProgressEvent]) -> Self {
        let mut obs = Observation::default();
        for event in events {
            if event.status == EventStatus::Stalled {
                obs.stall_count += 1;
            }
            if let Some(error) = &event.error {
                obs.errors.push(error.clone());
            }
            let Some(step) = &event.step else {
                continue;
            };
            obs.steps_attempted += 1;
            if step.success {
                obs.steps_succeeded += 1;
            } else {
                obs.steps_failed += 1;
            }
            obs.completion_log.push(step.tool.clone());
            if step.current_sql.is_some() {
                obs.current_sql = step.current_sql.clone();
            }
            if step.row_count.is_some() {
                obs.row_count = step.row_count;
            }
            obs.has_chart |= step.has_chart;
        }
        obs
    }

    /// Plain-text rendering for prompts.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Steps: {} attempted, {} succeeded, {} failed\nCompleted in order: {}\n",
            self.steps_attempted,
            self.steps_succeeded,
            self.steps_failed,
            if self.completion_log.is_empty() {
                "(none)".to_string()
            } else {
                self.completion_log.join(" -> ")
            }
        );
        match &self.current_sql {
            Some(sql) => out.push_str(&format!("Current SQL: {}\n", sql)),
            None => out.push_str("Current SQL: (none)\n"),
        }
        if let Some(rows) = self.row_count {
            out.push_str(&format!("Rows returned: {}\n", rows));
        }
        out.push_str(&format!("Chart built: {}\n", if self.has_chart { "yes" } else { "no" }));
        if self.stall_count > 0 {
            out.push_str(&format!("Stalls: {}\n", self.stall_count));
        }
        if !self.errors.is_empty() {
            out.push_str("Errors:\n");
            for error in &self.errors {
                out.push_str(&format!("- {}\n", error));
            }
        }
        out
    }
}
