//! Bounded retry with backoff
//!
//! A [`RetryPolicy`] is a plain value: a backoff schedule, an attempt cap and
//! an optional wall-clock deadline. Operations pass it explicitly together
//! with a predicate that says which failures are transient; everything else
//! short-circuits on the first attempt.
//!
//! All waiting goes through `tokio::time`, so tests drive the policy with a
//! paused clock instead of real sleeps.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time
    Fixed(Duration),
    /// `initial + step * (n - 1)`
    Linear { initial: Duration, step: Duration },
    /// `initial * multiplier^(n - 1)`, capped at `max`
    Exponential {
        initial: Duration,
        multiplier: u32,
        max: Duration,
    },
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let n = attempt.saturating_sub(1);
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear { initial, step } => initial.saturating_add(step.saturating_mul(n)),
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.max(1).checked_pow(n).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Why a retried operation gave up.
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Every allowed attempt failed with a transient error.
    #[error("gave up after {attempts} attempts ({elapsed:?}): {last}")]
    Exhausted {
        last: E,
        attempts: u32,
        elapsed: Duration,
    },
    /// A non-retryable error ended the loop.
    #[error("{0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(e) => e,
        }
    }
}

/// Backoff schedule plus termination bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Stop once the next wait would cross this much elapsed time
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
            deadline: None,
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self::new(Backoff::Fixed(interval), max_attempts)
    }

    /// Doubling backoff starting at `initial`, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self::new(
            Backoff::Exponential {
                initial,
                multiplier: 2,
                max,
            },
            max_attempts,
        )
    }

    /// Single attempt, no retries.
    pub fn once() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Run `op` until it succeeds, fails fatally, or the bound is reached.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        operation: &str,
        is_retryable: R,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempts = attempt, "Succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_retryable(&err) {
                return Err(RetryError::Fatal(err));
            }

            let elapsed = start.elapsed();
            let delay = self.backoff.delay(attempt);
            let past_deadline = self
                .deadline
                .is_some_and(|deadline| elapsed.saturating_add(delay) > deadline);

            if attempt >= self.max_attempts || past_deadline {
                warn!(
                    operation,
                    attempts = attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "Operation failed after retries"
                );
                return Err(RetryError::Exhausted {
                    last: err,
                    attempts: attempt,
                    elapsed,
                });
            }

            debug!(
                operation,
                attempt,
                max_attempts = self.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Retryable error, backing off"
            );
            metrics::record_retry(operation);

            tokio::time::sleep(delay).await;
        }
    }
}
