use crate::workflow::AttemptResult;
use tracing::warn;

/// Decision returned by the retry policy after one attempt at a video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The video was processed; move on.
    Proceed,
    /// Run the whole workflow again (1-based retry number).
    Retry { attempt: u32 },
    /// Give up on this video for the rest of the run. It stays out of the
    /// ledger and is picked up again next run.
    Skip,
    /// Shutdown requested; stop the batch.
    Stop,
}

/// In-run retry policy for failed videos.
///
/// Soft failures (unverified render, duration mismatch, oversize output) and
/// the retry-eligible watch failures (stuck, never appeared, timed out) are
/// retried up to `max_retries` times. A vanished output or a failing driver
/// skips the video at once.
pub struct RetryPolicy {
    max_retries: u32,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            current_attempt: 0,
        }
    }

    /// Evaluate the result of an attempt and decide what to do next.
    pub fn evaluate(&mut self, result: &AttemptResult) -> RetryDecision {
        match result {
            AttemptResult::Processed { .. } => return RetryDecision::Proceed,
            AttemptResult::Interrupted => return RetryDecision::Stop,
            AttemptResult::Failed(e) if !e.retry_eligible() => {
                warn!(error = %e, "failure is not retryable, skipping video");
                return RetryDecision::Skip;
            }
            _ => {}
        }

        self.current_attempt += 1;

        if self.current_attempt <= self.max_retries {
            warn!(
                reason = %result,
                attempt = self.current_attempt,
                max_retries = self.max_retries,
                "attempt failed, retrying"
            );
            RetryDecision::Retry {
                attempt: self.current_attempt,
            }
        } else {
            warn!(
                reason = %result,
                max_retries = self.max_retries,
                "retries exhausted, skipping video"
            );
            RetryDecision::Skip
        }
    }

    /// Reset the retry counter for the next video.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Current attempt count (0 = no retries yet).
    #[cfg(test)]
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverError;
    use crate::monitor::MonitorError;
    use crate::workflow::{AttemptError, Rejection};
    use std::path::PathBuf;
    use std::time::Duration;

    fn processed() -> AttemptResult {
        AttemptResult::Processed {
            duration_secs: Some(42.0),
            size: 1000,
        }
    }

    fn mismatch() -> AttemptResult {
        AttemptResult::Rejected(Rejection::DurationMismatch {
            source_secs: 60.0,
            output_secs: 42.0,
        })
    }

    fn stuck() -> AttemptResult {
        AttemptResult::Failed(AttemptError::Watch(MonitorError::Stuck {
            size: 10,
            checks: 10,
            unchanged_for: Duration::from_secs(600),
        }))
    }

    #[test]
    fn test_proceed_when_processed() {
        let mut policy = RetryPolicy::new(2);
        assert_eq!(policy.evaluate(&processed()), RetryDecision::Proceed);
        assert_eq!(policy.current_attempt(), 0);
    }

    #[test]
    fn test_rejection_retries_then_skips() {
        let mut policy = RetryPolicy::new(2);
        assert_eq!(policy.evaluate(&mismatch()), RetryDecision::Retry { attempt: 1 });
        assert_eq!(policy.evaluate(&stuck()), RetryDecision::Retry { attempt: 2 });
        assert_eq!(policy.evaluate(&mismatch()), RetryDecision::Skip);
    }

    #[test]
    fn test_disappeared_skips_immediately() {
        let mut policy = RetryPolicy::new(2);
        let result = AttemptResult::Failed(AttemptError::Watch(MonitorError::Disappeared {
            path: PathBuf::from("/out/a.mp4"),
        }));
        assert_eq!(policy.evaluate(&result), RetryDecision::Skip);
        assert_eq!(policy.current_attempt(), 0);
    }

    #[test]
    fn test_driver_failure_skips_immediately() {
        let mut policy = RetryPolicy::new(2);
        let result = AttemptResult::Failed(AttemptError::Driver(DriverError::NotConfigured));
        assert_eq!(policy.evaluate(&result), RetryDecision::Skip);
    }

    #[test]
    fn test_interrupted_stops() {
        let mut policy = RetryPolicy::new(2);
        assert_eq!(
            policy.evaluate(&AttemptResult::Interrupted),
            RetryDecision::Stop
        );
    }

    #[test]
    fn test_timeout_is_retryable() {
        let mut policy = RetryPolicy::new(1);
        let result = AttemptResult::Failed(AttemptError::Watch(MonitorError::TimedOut {
            timeout: Duration::from_secs(7200),
            last_size: Some(5),
        }));
        assert_eq!(policy.evaluate(&result), RetryDecision::Retry { attempt: 1 });
    }

    #[test]
    fn test_reset_clears_attempt_counter() {
        let mut policy = RetryPolicy::new(2);
        policy.evaluate(&mismatch());
        policy.evaluate(&mismatch());
        assert_eq!(policy.current_attempt(), 2);

        policy.reset();
        assert_eq!(policy.current_attempt(), 0);
        assert_eq!(policy.evaluate(&mismatch()), RetryDecision::Retry { attempt: 1 });
    }

    #[test]
    fn test_zero_max_retries_skips_immediately() {
        let mut policy = RetryPolicy::new(0);
        assert_eq!(policy.evaluate(&mismatch()), RetryDecision::Skip);
    }
}
