//! Retry controller for failed task attempts.
//!
//! Stateless: given a task's `RetryPolicy`, the number of attempts made and
//! the error of the last one, decide whether to retry and after which delay.
//! The scheduler turns a `Retry` decision into a deadline on its delay heap;
//! nothing here sleeps.

use std::time::Duration;

use weft_types::workflow::{RetryOn, RetryPolicy, TaskError, TaskErrorKind};

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the task after `delay`.
    Retry { delay: Duration },
    /// The failure is final.
    GiveUp,
}

/// Stateless retry controller. All logic is in associated functions.
pub struct RetryController;

impl RetryController {
    /// Backoff before retry number `retry_number` (0-based):
    /// `min(base * factor^retry_number, max)`.
    pub fn backoff_delay(policy: &RetryPolicy, retry_number: u32) -> Duration {
        let backoff = &policy.backoff;
        let exponent = i32::try_from(retry_number).unwrap_or(i32::MAX);
        let raw = backoff.base_ms as f64 * backoff.factor.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(backoff.max_ms as f64)
        } else {
            backoff.max_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Whether an error of this kind may be retried under `policy`.
    pub fn is_retryable(policy: &RetryPolicy, kind: TaskErrorKind) -> bool {
        match kind {
            TaskErrorKind::ExecutionRetryable => true,
            TaskErrorKind::ExecutionNonRetryable => policy.retry_on == RetryOn::Any,
            TaskErrorKind::Timeout => policy.retry_timeouts,
            // Evaluation errors fail identically on every attempt; cancellations
            // and invariant violations are never retried.
            TaskErrorKind::UnresolvedReference
            | TaskErrorKind::TypeError
            | TaskErrorKind::Expression
            | TaskErrorKind::UpstreamFailed
            | TaskErrorKind::Cancelled
            | TaskErrorKind::DuplicateOutput
            | TaskErrorKind::OutputTooLarge => false,
        }
    }

    /// Decide what to do after attempt number `attempt` (1-based) failed.
    pub fn decide(policy: Option<&RetryPolicy>, attempt: u32, error: &TaskError) -> RetryDecision {
        let Some(policy) = policy else {
            return RetryDecision::GiveUp;
        };
        if attempt >= policy.max_attempts() || !Self::is_retryable(policy, error.kind) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: Self::backoff_delay(policy, attempt.saturating_sub(1)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::workflow::Backoff;

    fn policy(limit: u32) -> RetryPolicy {
        RetryPolicy {
            limit,
            backoff: Backoff {
                base_ms: 1_000,
                factor: 2.0,
                max_ms: 300_000,
            },
            ..Default::default()
        }
    }

    fn err(kind: TaskErrorKind) -> TaskError {
        TaskError::new(kind, "boom")
    }

    #[test]
    fn test_backoff_sequence_doubles() {
        let p = policy(3);
        let delays: Vec<u64> = (0..3)
            .map(|n| RetryController::backoff_delay(&p, n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000]);
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let mut p = policy(20);
        p.backoff.max_ms = 5_000;
        assert_eq!(RetryController::backoff_delay(&p, 10), Duration::from_millis(5_000));
        assert_eq!(
            RetryController::backoff_delay(&p, u32::MAX),
            Duration::from_millis(5_000)
        );
    }

    #[test]
    fn test_limit_three_allows_four_attempts() {
        let p = policy(3);
        let e = err(TaskErrorKind::ExecutionRetryable);
        assert_eq!(
            RetryController::decide(Some(&p), 1, &e),
            RetryDecision::Retry {
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            RetryController::decide(Some(&p), 3, &e),
            RetryDecision::Retry {
                delay: Duration::from_secs(4)
            }
        );
        assert_eq!(RetryController::decide(Some(&p), 4, &e), RetryDecision::GiveUp);
    }

    #[test]
    fn test_no_policy_never_retries() {
        let e = err(TaskErrorKind::ExecutionRetryable);
        assert_eq!(RetryController::decide(None, 1, &e), RetryDecision::GiveUp);
    }

    #[test]
    fn test_non_retryable_respects_retry_on() {
        let mut p = policy(2);
        let e = err(TaskErrorKind::ExecutionNonRetryable);
        assert_eq!(RetryController::decide(Some(&p), 1, &e), RetryDecision::GiveUp);
        p.retry_on = RetryOn::Any;
        assert!(matches!(
            RetryController::decide(Some(&p), 1, &e),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_timeouts_retry_only_when_opted_in() {
        let mut p = policy(2);
        let e = err(TaskErrorKind::Timeout);
        assert_eq!(RetryController::decide(Some(&p), 1, &e), RetryDecision::GiveUp);
        p.retry_timeouts = true;
        assert!(matches!(
            RetryController::decide(Some(&p), 1, &e),
            RetryDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_evaluation_and_invariant_errors_never_retry() {
        let mut p = policy(5);
        p.retry_on = RetryOn::Any;
        for kind in [
            TaskErrorKind::UnresolvedReference,
            TaskErrorKind::TypeError,
            TaskErrorKind::Cancelled,
            TaskErrorKind::DuplicateOutput,
        ] {
            assert_eq!(
                RetryController::decide(Some(&p), 1, &err(kind)),
                RetryDecision::GiveUp,
                "{kind:?} must not retry"
            );
        }
    }
}
