//! Why a completion request failed, and when it is worth asking again.
//!
//! Completions are awaited under the task's stall guard, so retries must
//! finish well inside the stall threshold: [`RetryPolicy::within`] derives
//! the retry budget from it.

use std::time::Duration;

/// Failure classes of a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 429 from the endpoint.
    Throttled,
    /// 5xx from the endpoint.
    Unavailable,
    /// Any other 4xx: bad key, unknown model, oversized prompt.
    Rejected,
    /// The request never got a response.
    Unreachable,
    /// A 2xx whose body is not a chat completion.
    Malformed,
}

impl FailureKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => FailureKind::Throttled,
            400..=499 => FailureKind::Rejected,
            _ => FailureKind::Unavailable,
        }
    }

    /// Whether the same request may succeed if sent again.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            FailureKind::Throttled | FailureKind::Unavailable | FailureKind::Unreachable
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            FailureKind::Throttled => "throttled",
            FailureKind::Unavailable => "endpoint unavailable",
            FailureKind::Rejected => "request rejected",
            FailureKind::Unreachable => "endpoint unreachable",
            FailureKind::Malformed => "malformed completion",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionError {
    pub kind: FailureKind,
    pub status: Option<u16>,
    pub detail: String,
    /// Server-requested wait, from `Retry-After`.
    pub retry_after: Option<Duration>,
}

impl CompletionError {
    pub fn from_status(status: u16, body: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: FailureKind::from_status(status),
            status: Some(status),
            detail: body.into(),
            retry_after,
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Unreachable,
            status: None,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Malformed,
            status: None,
            detail: detail.into(),
            retry_after: None,
        }
    }
}

impl std::fmt::Display for CompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {}): {}", self.kind, status, self.detail),
            None => write!(f, "{}: {}", self.kind, self.detail),
        }
    }
}

impl std::error::Error for CompletionError {}

/// Bounded exponential backoff for transient completion failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Total time, from the first send, that retries may consume.
    pub budget: Duration,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            budget: Duration::from_secs(30),
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Keep retries inside half of the stall threshold so a retrying call
    /// is not abandoned as stalled.
    pub fn within(stall_threshold: Duration) -> Self {
        Self {
            budget: stall_threshold / 2,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt + 1`, or `None` to give up.
    ///
    /// Throttling backs off four times harder than other transient kinds.
    pub fn next_delay(&self, error: &CompletionError, attempt: u32, elapsed: Duration) -> Option<Duration> {
        if !error.kind.is_transient() || attempt >= self.max_retries {
            return None;
        }
        let delay = error.retry_after.unwrap_or_else(|| {
            let factor = if error.kind == FailureKind::Throttled { 4 } else { 1 };
            self.base_delay
                .saturating_mul(factor)
                .saturating_mul(2u32.saturating_pow(attempt))
        });
        (elapsed.saturating_add(delay) <= self.budget).then_some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_kinds() {
        assert_eq!(FailureKind::from_status(429), FailureKind::Throttled);
        assert_eq!(FailureKind::from_status(401), FailureKind::Rejected);
        assert_eq!(FailureKind::from_status(503), FailureKind::Unavailable);
        assert!(!FailureKind::Malformed.is_transient());
    }

    #[test]
    fn backoff_doubles_and_respects_budget() {
        let policy = RetryPolicy {
            max_retries: 5,
            budget: Duration::from_secs(3),
            base_delay: Duration::from_millis(500),
        };
        let busy = CompletionError::from_status(502, "bad gateway", None);
        assert_eq!(policy.next_delay(&busy, 0, Duration::ZERO), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(&busy, 2, Duration::ZERO), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(&busy, 2, Duration::from_secs(2)), None);

        let throttled = CompletionError::from_status(429, "slow down", None);
        assert_eq!(policy.next_delay(&throttled, 0, Duration::ZERO), Some(Duration::from_secs(2)));
    }

    #[test]
    fn rejected_and_exhausted_requests_are_not_retried() {
        let policy = RetryPolicy::within(Duration::from_secs(60));
        assert_eq!(policy.budget, Duration::from_secs(30));

        let rejected = CompletionError::from_status(400, "context too long", None);
        assert_eq!(policy.next_delay(&rejected, 0, Duration::ZERO), None);

        let unreachable = CompletionError::unreachable("connection refused");
        assert_eq!(policy.next_delay(&unreachable, policy.max_retries, Duration::ZERO), None);
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let policy = RetryPolicy::default();
        let error = CompletionError::from_status(429, "later", Some(Duration::from_secs(7)));
        assert_eq!(policy.next_delay(&error, 2, Duration::ZERO), Some(Duration::from_secs(7)));
        assert_eq!(error.to_string(), "throttled (HTTP 429): later");
    }
}
