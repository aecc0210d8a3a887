//! # Retry Policy with Exponential Backoff
//!
//! Re-executes a logical operation when it fails transiently. Fatal failures
//! and every non-storage error propagate on first occurrence; transient ones
//! are retried until the attempt budget runs out, then surface as
//! `RetryExhausted` carrying the last cause.
//!
//! The operation is a closure producing a fresh future per attempt, so the
//! natural boundary is a whole `scoped` unit of work, never a unit that has
//! already been closed.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{DalError, FailureKind, StorageFailure};
use crate::journal;
use crate::telemetry;

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Exponential backoff calculator with jitter support
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
            current_attempt: 0,
        }
    }

    /// Calculates the next delay duration
    pub fn next_delay(&mut self) -> Duration {
        let base_delay = self.base_delay.as_millis() as f64;
        let multiplier = self.multiplier.powi(self.current_attempt.min(i32::MAX as u32) as i32);
        let capped = (base_delay * multiplier).min(self.max_delay.as_millis() as f64);
        let mut delay = Duration::from_millis(capped as u64);

        if self.jitter {
            delay = Self::add_jitter(delay);
        }

        self.current_attempt = self.current_attempt.saturating_add(1);
        delay
    }

    /// Adds up to 25% random jitter
    fn add_jitter(delay: Duration) -> Duration {
        use rand::Rng;
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
        delay + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Delays handed out so far
    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}

/// Successful result of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Kind of the last transient failure, if any attempt failed
    pub last_failure: Option<FailureKind>,
}

/// Retry policy for transient storage failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    total_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Policy making at most `max_attempts` attempts in total
    ///
    /// Attempt 1 is the first try; `0` is treated as `1`.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: DEFAULT_MAX_DELAY.max(base_delay),
            multiplier: DEFAULT_MULTIPLIER,
            jitter: true,
            total_timeout: None,
        }
    }

    /// Policy derived from a configuration: `n` retries allow `n + 1` attempts
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(
            config.max_retry_attempts.saturating_add(1),
            config.retry.base_delay(),
        )
        .with_max_delay(config.retry.max_delay())
        .with_multiplier(config.retry.multiplier)
        .with_jitter(config.retry.jitter)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            DEFAULT_MULTIPLIER
        };
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Give up early once the next delay would cross `timeout`
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter(&self) -> bool {
        self.jitter
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout
    }

    /// Run `operation`, retrying transient failures
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<RetryOutcome<T>, DalError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DalError>>,
    {
        self.run(operation, None).await
    }

    /// Like `execute`, checking `cancel` before every attempt and during backoff
    ///
    /// A running attempt is never interrupted; pass the token into the
    /// operation itself to cancel in-flight work.
    pub async fn execute_with_cancel<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<RetryOutcome<T>, DalError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DalError>>,
    {
        self.run(operation, Some(cancel)).await
    }

    /// Run `operation` and return just its value
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, DalError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DalError>>,
    {
        self.execute(operation).await.map(|outcome| outcome.value)
    }

    /// Wrap `operation` so every call goes through this policy
    pub fn resilient<F>(&self, operation: F) -> Resilient<F> {
        Resilient {
            policy: self.clone(),
            operation,
        }
    }

    fn exhausted(&self, attempts: u32, failure: StorageFailure) -> DalError {
        journal::log_retry_exhausted(attempts, &failure);
        telemetry::record_retry_exhausted();
        DalError::RetryExhausted {
            attempts,
            source: failure,
        }
    }

    async fn run<T, F, Fut>(
        &self,
        mut operation: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<RetryOutcome<T>, DalError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DalError>>,
    {
        let start_time = Instant::now();
        let mut backoff = ExponentialBackoff::new(self);
        let mut last_failure = None;
        let mut attempt = 0u32;

        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                return Err(DalError::cancelled("retry"));
            }
            attempt += 1;

            let failure = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "Operation succeeded after retry");
                    }
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt,
                        last_failure,
                    });
                }
                Err(err) => match err.into_transient() {
                    Ok(failure) => failure,
                    Err(fatal) => {
                        debug!(attempt, error = %fatal, "Error is not retryable");
                        return Err(fatal);
                    }
                },
            };
            last_failure = Some(failure.kind());

            if attempt >= self.max_attempts {
                return Err(self.exhausted(attempt, failure));
            }

            let delay = backoff.next_delay();
            if let Some(total_timeout) = self.total_timeout {
                if start_time.elapsed() + delay >= total_timeout {
                    debug!(attempt, ?total_timeout, "Total retry timeout reached");
                    return Err(self.exhausted(attempt, failure));
                }
            }

            telemetry::record_retry_attempt(failure.kind());
            journal::log_retry_attempt(attempt, self.max_attempts, delay, &failure);

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(DalError::cancelled("retry backoff")),
                        _ = sleep(delay) => {}
                    }
                }
                None => sleep(delay).await,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DatabaseConfig::default())
    }
}

/// An operation bound to a retry policy
pub struct Resilient<F> {
    policy: RetryPolicy,
    operation: F,
}

impl<F, Fut, T> Resilient<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DalError>>,
{
    pub async fn call(&mut self) -> Result<T, DalError> {
        self.policy.call(&mut self.operation).await
    }

    pub async fn execute(&mut self) -> Result<RetryOutcome<T>, DalError> {
        self.policy.execute(&mut self.operation).await
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
