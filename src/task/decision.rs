//! The terminal decision of a task, and the strict parser for the model's
//! draft of it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::extract_json_object;

/// Terminal record of a finished task.
///
/// # Invariants
/// - exactly one per finished task, immutable once written
/// - `0.0 <= quality_score <= 1.0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub success: bool,
    pub result: String,
    pub reasoning: String,
    pub quality_score: f64,
}

impl Decision {
    pub fn new(
        success: bool,
        result: impl Into<String>,
        reasoning: impl Into<String>,
        quality_score: f64,
    ) -> Self {
        Self {
            success,
            result: result.into(),
            reasoning: reasoning.into(),
            quality_score: quality_score.clamp(0.0, 1.0),
        }
    }

    /// A failed decision carrying the reason in `reasoning`.
    pub fn failure(reasoning: impl Into<String>) -> Self {
        Self::new(false, String::new(), reasoning, 0.0)
    }

    /// Attach whatever partial output exists to a failure.
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = result.into();
        self
    }
}

/// The model's proposed decision, before re-validation.
///
/// Every field is required; a missing field is a parse failure, never a
/// silent default.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionDraft {
    pub success: bool,
    pub result: String,
    pub reasoning: String,
    pub quality_score: f64,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    success: Option<bool>,
    result: Option<Value>,
    reasoning: Option<String>,
    #[serde(alias = "qualityScore")]
    quality_score: Option<f64>,
}

/// Why a model response could not be accepted as a decision.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecisionParseError {
    #[error("response contains no JSON object")]
    NoJson,

    #[error("malformed decision JSON: {0}")]
    Malformed(String),

    #[error("decision is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("quality_score {0} is outside [0, 1]")]
    ScoreOutOfRange(f64),
}

impl DecisionDraft {
    /// Parse `{success, result, reasoning, quality_score}` out of a model
    /// response, failing closed.
    pub fn parse(response: &str) -> Result<Self, DecisionParseError> {
        let json = extract_json_object(response).ok_or(DecisionParseError::NoJson)?;
        let raw: RawDecision =
            serde_json::from_str(json).map_err(|e| DecisionParseError::Malformed(e.to_string()))?;

        let success = raw.success.ok_or(DecisionParseError::MissingField("success"))?;
        let result = match raw.result.ok_or(DecisionParseError::MissingField("result"))? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let reasoning = raw
            .reasoning
            .ok_or(DecisionParseError::MissingField("reasoning"))?;
        let quality_score = raw
            .quality_score
            .ok_or(DecisionParseError::MissingField("quality_score"))?;

        if !(0.0..=1.0).contains(&quality_score) {
            return Err(DecisionParseError::ScoreOutOfRange(quality_score));
        }

        Ok(Self {
            success,
            result,
            reasoning,
            quality_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_decision() {
        let text = "```json\n{\"success\": true, \"result\": \"SELECT 1\", \"reasoning\": \"fine\", \"quality_score\": 0.85}\n```";
        let draft = DecisionDraft::parse(text).expect("decision");
        assert!(draft.success);
        assert_eq!(draft.result, "SELECT 1");
        assert!((draft.quality_score - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_fields_fail_closed() {
        let err = DecisionDraft::parse(r#"{"success": true, "result": "x", "reasoning": "r"}"#)
            .unwrap_err();
        assert_eq!(err, DecisionParseError::MissingField("quality_score"));

        let err = DecisionDraft::parse(r#"{"result": "x", "reasoning": "r", "quality_score": 1}"#)
            .unwrap_err();
        assert_eq!(err, DecisionParseError::MissingField("success"));
    }

    #[test]
    fn score_out_of_range_is_rejected() {
        let err = DecisionDraft::parse(
            r#"{"success": true, "result": "x", "reasoning": "r", "quality_score": 1.5}"#,
        )
        .unwrap_err();
        assert_eq!(err, DecisionParseError::ScoreOutOfRange(1.5));
    }

    #[test]
    fn structured_result_is_kept_as_json_text() {
        let draft = DecisionDraft::parse(
            r#"{"success": false, "result": {"rows": 3}, "reasoning": "r", "qualityScore": 0.1}"#,
        )
        .expect("decision");
        assert_eq!(draft.result, r#"{"rows":3}"#);
    }

    #[test]
    fn prose_without_json_is_rejected() {
        assert_eq!(
            DecisionDraft::parse("I think it worked.").unwrap_err(),
            DecisionParseError::NoJson
        );
    }

    #[test]
    fn failure_helper_clamps_and_defaults() {
        let d = Decision::failure("boom").with_result("SELECT 1");
        assert!(!d.success);
        assert_eq!(d.result, "SELECT 1");
        assert_eq!(d.quality_score, 0.0);
        assert_eq!(Decision::new(true, "", "", 7.0).quality_score, 1.0);
    }
}
