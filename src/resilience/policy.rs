use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;

/// What the executor does when a batch fails after any retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Abort the whole run on the first failed batch
    FailFast,

    /// Log and drop the failed batch, keep going
    Skip,

    /// Drop failed batches until the error rate over at least `min_samples`
    /// batches exceeds `max_error_rate`, then abort
    Tolerant { max_error_rate: f64, min_samples: u64 },
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::FailFast
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Abort,
    Drop,
}

impl ErrorPolicy {
    /// Judge a failure given the running totals, `errors` already including it.
    pub fn judge(&self, errors: u64, attempted: u64) -> Verdict {
        match self {
            Self::FailFast => Verdict::Abort,
            Self::Skip => Verdict::Drop,
            Self::Tolerant {
                max_error_rate,
                min_samples,
            } => {
                if attempted >= *min_samples && error_rate(errors, attempted) > *max_error_rate {
                    Verdict::Abort
                } else {
                    Verdict::Drop
                }
            }
        }
    }
}

pub fn error_rate(errors: u64, attempted: u64) -> f64 {
    if attempted == 0 {
        return 0.0;
    }
    errors as f64 / attempted as f64
}

/// Bounded retry for idempotent calls (source fetch, sink write).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one; 1 disables retries
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Exponential backoff before attempt `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_fast_always_aborts() {
        assert_eq!(ErrorPolicy::FailFast.judge(1, 100), Verdict::Abort);
        assert_eq!(ErrorPolicy::Skip.judge(100, 100), Verdict::Drop);
    }

    #[test]
    fn test_tolerant_waits_for_min_samples() {
        let policy = ErrorPolicy::Tolerant {
            max_error_rate: 0.2,
            min_samples: 10,
        };
        // 3/4 is over the threshold but the sample is too small
        assert_eq!(policy.judge(3, 4), Verdict::Drop);
        assert_eq!(policy.judge(2, 10), Verdict::Drop);
        assert_eq!(policy.judge(3, 10), Verdict::Abort);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::attempts(10)
            .with_delays(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(20), Duration::from_millis(1_000));
    }

    #[test]
    fn test_should_retry_counts_first_attempt() {
        let policy = RetryPolicy::attempts(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn test_error_policy_from_json() {
        let policy: ErrorPolicy =
            serde_json::from_value(serde_json::json!({"mode": "tolerant", "max_error_rate": 0.1, "min_samples": 20}))
                .unwrap();
        assert_eq!(
            policy,
            ErrorPolicy::Tolerant {
                max_error_rate: 0.1,
                min_samples: 20
            }
        );
    }
}
