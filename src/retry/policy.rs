//! Retry policies and the error-class recovery table

use crate::error::{ErrorClass, SubmitterError};

use rand::Rng;
use std::time::Duration;

/// Error classes retried by the stock policies
pub const DEFAULT_RETRYABLE: &[ErrorClass] = &[
    ErrorClass::Transient,
    ErrorClass::RateLimited,
    ErrorClass::SequenceConflict,
    ErrorClass::Underpriced,
];

/// What the pipeline does after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Run the same call again
    Retry,
    /// Resync the account's nonce state from the ledger first
    RepairSequence,
    /// Re-quote at a bumped price first
    RaiseFee,
    /// Give up
    Abort,
}

const RECOVERY_TABLE: &[(ErrorClass, Recovery)] = &[
    (ErrorClass::Transient, Recovery::Retry),
    (ErrorClass::RateLimited, Recovery::Retry),
    (ErrorClass::SequenceConflict, Recovery::RepairSequence),
    (ErrorClass::Underpriced, Recovery::RaiseFee),
    (ErrorClass::Validation, Recovery::Abort),
    (ErrorClass::Fatal, Recovery::Abort),
];

impl Recovery {
    /// Look up the recovery action for an error class
    pub fn for_class(class: ErrorClass) -> Recovery {
        RECOVERY_TABLE
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, recovery)| *recovery)
            .unwrap_or(Recovery::Abort)
    }
}

/// Retry policy. Plain data: callers copy a preset and override fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Relative jitter applied to each delay (0.25 = ±25%)
    pub jitter: f64,
    pub retryable: Vec<ErrorClass>,
}

impl RetryPolicy {
    /// Profile for steps with on-chain side effects: few attempts, long delays
    pub fn transaction() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.25,
            retryable: DEFAULT_RETRYABLE.to_vec(),
        }
    }

    /// Profile for read-only node queries: more attempts, short delays
    pub fn rpc_query() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.25,
            retryable: DEFAULT_RETRYABLE.to_vec(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_retryable(mut self, retryable: &[ErrorClass]) -> Self {
        self.retryable = retryable.to_vec();
        self
    }

    /// Whether this policy retries the given error
    pub fn should_retry(&self, error: &SubmitterError) -> bool {
        self.retryable.contains(&error.class())
    }

    /// Delay after the given (1-based) failed attempt, before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_secs_f64() * 1000.0 * self.backoff_multiplier.powi(exponent);
        self.clamp_millis(millis)
    }

    /// Jittered delay after the given failed attempt, never above `max_delay`
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.backoff(attempt).as_secs_f64() * 1000.0;
        let jitter = self.jitter.abs();
        let factor = if jitter > 0.0 {
            1.0 + rng.gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        self.clamp_millis(base * factor)
    }

    fn clamp_millis(&self, millis: f64) -> Duration {
        let max = self.max_delay.as_secs_f64() * 1000.0;
        let millis = if millis.is_finite() { millis.min(max) } else { max };
        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::rpc_query()
    }
}
