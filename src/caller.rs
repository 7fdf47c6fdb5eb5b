//! Retrying wrapper around single calls to the rate-limited AI service.
use std::future::Future;
use std::sync::Arc;

use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{ExternalCallExhausted, ExternalError};
use crate::rate_limiter::RateLimiter;

/// Count of failed attempts a unit of work may still absorb.
///
/// The queue threads one budget through every step of a job, so call-level
/// retries and whole-job re-queues draw from the same allowance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryBudget {
    used: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    /// A budget of which `used` units were spent earlier.
    pub fn resume(used: u32, max: u32) -> Self {
        Self {
            used: used.min(max),
            max,
        }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// Spends one unit. Returns whether any budget is left afterwards.
    pub fn consume(&mut self) -> bool {
        self.used = (self.used + 1).min(self.max);
        !self.is_exhausted()
    }
}

/// Performs external calls gated by the shared [`RateLimiter`], retrying
/// with a backoff that depends on how the call failed.
#[derive(Clone, Debug)]
pub struct ExternalCaller {
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
}

impl ExternalCaller {
    pub fn new(limiter: Arc<RateLimiter>, policy: RetryPolicy) -> Self {
        Self { limiter, policy }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Runs `op` with a fresh budget of `max_retries` attempts.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        caller_id: &str,
        op: F,
    ) -> Result<T, ExternalCallExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExternalError>>,
    {
        let mut budget = RetryBudget::new(self.policy.max_retries);
        self.call_with_budget(operation, caller_id, &mut budget, op)
            .await
    }

    /// Runs `op` until it succeeds or `budget` runs dry. Every failed
    /// attempt consumes one unit. At least one attempt is always made.
    ///
    /// Before each attempt this waits for a free slot in the rate window;
    /// only successful attempts are recorded against it.
    pub async fn call_with_budget<T, F, Fut>(
        &self,
        operation: &'static str,
        caller_id: &str,
        budget: &mut RetryBudget,
        mut op: F,
    ) -> Result<T, ExternalCallExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExternalError>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let waited = self.limiter.wait_for_slot().await;
            if !waited.is_zero() {
                debug!(
                    operation,
                    waited_ms = waited.as_millis() as u64,
                    "got rate slot"
                );
            }

            let started = Instant::now();
            let error = match op().await {
                Ok(value) => {
                    self.limiter.record_call(caller_id);
                    debug!(
                        operation,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "external call succeeded"
                    );
                    return Ok(value);
                },
                Err(error) => error,
            };

            if !budget.consume() {
                warn!(
                    operation,
                    attempt,
                    %error,
                    "external call failed, retry budget exhausted"
                );
                return Err(ExternalCallExhausted {
                    operation,
                    attempts: attempt,
                    last: error,
                });
            }

            let wait = if error.is_throttled() {
                self.policy.throttle_delay(attempt)
            } else {
                self.policy.transient_backoff
            };

            warn!(
                operation,
                attempt,
                used = budget.used(),
                max = budget.max(),
                wait_ms = wait.as_millis() as u64,
                %error,
                "external call failed, backing off"
            );

            time::sleep(wait).await;
        }
    }
}
