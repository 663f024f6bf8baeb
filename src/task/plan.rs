//! Execution plans produced by the planner.
//!
//! A plan is an ordered list of tool calls. It is parsed strictly out of the
//! model's response and never mutated afterwards; re-planning builds a new
//! [`ExecutionPlan`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::extract_json_object;

/// One planned tool call.
///
/// # Invariants
/// - the position of a step in `ExecutionPlan::steps` is its execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Registered tool name
    pub tool: String,
    /// Why the planner wants this call
    pub reason: String,
    /// Tool-specific input
    #[serde(default)]
    pub input: Map<String, Value>,
}

/// A plan for one planning round.
///
/// # Invariants
/// - `steps` is non-empty and no longer than the configured step cap
/// - every step names a tool advertised for the round's stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub thought: String,
    pub steps: Vec<PlanStep>,
    pub expected_outcome: String,
}

/// Reasons a plan response is rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("response contains no JSON object")]
    NoJson,

    #[error("malformed plan JSON: {0}")]
    Malformed(String),

    #[error("plan is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("plan has no steps")]
    Empty,

    #[error("plan has {count} steps, the limit is {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("step {index} is missing required field `{field}`")]
    StepMissingField { index: usize, field: &'static str },

    #[error("step {index} uses tool `{tool}`, which is not available in this stage")]
    UnknownTool { index: usize, tool: String },
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    thought: Option<String>,
    steps: Option<Vec<RawStep>>,
    #[serde(alias = "expectedOutcome")]
    expected_outcome: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    tool: Option<String>,
    reason: Option<String>,
    #[serde(default)]
    input: Option<Map<String, Value>>,
}

impl ExecutionPlan {
    /// Parse and validate a plan.
    ///
    /// `allowed_tools` is the stage-filtered catalog that was advertised to
    /// the model; anything else is rejected.
    pub fn parse(
        response: &str,
        allowed_tools: &[&str],
        max_steps: usize,
    ) -> Result<Self, PlanError> {
        let json = extract_json_object(response).ok_or(PlanError::NoJson)?;
        let raw: RawPlan =
            serde_json::from_str(json).map_err(|e| PlanError::Malformed(e.to_string()))?;

        let thought = raw.thought.ok_or(PlanError::MissingField("thought"))?;
        let raw_steps = raw.steps.ok_or(PlanError::MissingField("steps"))?;
        let expected_outcome = raw
            .expected_outcome
            .ok_or(PlanError::MissingField("expected_outcome"))?;

        if raw_steps.is_empty() {
            return Err(PlanError::Empty);
        }
        if raw_steps.len() > max_steps {
            return Err(PlanError::TooManySteps {
                count: raw_steps.len(),
                max: max_steps,
            });
        }

        let mut steps = Vec::with_capacity(raw_steps.len());
        for (index, raw_step) in raw_steps.into_iter().enumerate() {
            let tool = raw_step
                .tool
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .ok_or(PlanError::StepMissingField {
                    index,
                    field: "tool",
                })?;
            let reason = raw_step.reason.ok_or(PlanError::StepMissingField {
                index,
                field: "reason",
            })?;
            if !allowed_tools.contains(&tool.as_str()) {
                return Err(PlanError::UnknownTool { index, tool });
            }
            steps.push(PlanStep {
                tool,
                reason,
                input: raw_step.input.unwrap_or_default(),
            });
        }

        Ok(Self {
            thought,
            steps,
            expected_outcome,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Tool names in execution order.
    pub fn tool_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.tool.as_str()).collect()
    }
}
