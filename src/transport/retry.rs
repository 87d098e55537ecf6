//! Retry policy for connection-level failures.

use std::time::Duration;

use crate::config::SessionConfig;

/// Decides whether and when a failed attempt is repeated.
pub trait RetryPolicy: Send + Sync {
    /// Total attempts, including the first
    fn max_attempts(&self) -> u32;

    /// Whether attempt `attempt` (0-based) may be followed by another
    fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts()
    }

    /// Delay after the failed attempt `attempt` (0-based)
    fn backoff(&self, attempt: u32) -> Duration;
}

/// `base_delay * 2^attempt` between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Total attempts; values below 1 still make one attempt
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ExponentialBackoff {
    /// Create a policy
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Policy from a session's `max_retries` and `retry_delay`
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1 << attempt.min(16))
    }
}
