//! Policy executor

use super::policy::{Recovery, RetryPolicy};
use crate::error::{SubmitterError, SubmitterResult};

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Result of running an operation under a policy
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: SubmitterResult<T>,
    /// Number of times the operation was invoked
    pub attempts: u32,
    /// Sum of all backoff sleeps
    pub total_delay: Duration,
    /// True when the last error was retryable but attempts ran out
    pub exhausted: bool,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Drop the bookkeeping and keep the result
    pub fn into_result(self) -> SubmitterResult<T> {
        self.result
    }
}

/// Stateless retry executor
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryEngine;

impl RetryEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run `operation` until it succeeds, fails fatally, or the policy's
    /// attempts are used up. The operation receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SubmitterResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts = 0;
        let mut total_delay = Duration::ZERO;

        loop {
            attempts += 1;

            let error = match operation(attempts).await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "Operation succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        total_delay,
                        exhausted: false,
                    };
                }
                Err(e) => e,
            };

            let retryable = policy.should_retry(&error);
            if !retryable || attempts >= max_attempts {
                if retryable {
                    warn!(attempts, error = %error, "Retry attempts exhausted");
                } else {
                    debug!(attempts, error = %error, "Non-retryable failure");
                }
                return RetryOutcome {
                    result: Err(error),
                    attempts,
                    total_delay,
                    exhausted: retryable,
                };
            }

            let delay = {
                let mut rng = rand::thread_rng();
                policy.delay_for(attempts, &mut rng)
            };
            warn!(
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, backing off"
            );
            sleep(delay).await;
            total_delay += delay;
        }
    }

    /// Whether a failure should be followed by a nonce repair
    pub fn should_repair_sequence(error: &SubmitterError) -> bool {
        Recovery::for_class(error.class()) == Recovery::RepairSequence
    }

    /// Whether a failure should be followed by a fee bump
    pub fn should_raise_fee(error: &SubmitterError) -> bool {
        Recovery::for_class(error.class()) == Recovery::RaiseFee
    }
}
