//! Retry policy and the rate limiter wrapped around every upstream call.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::jobs::control::{Interrupted, cancellable_sleep};

/// How the wait grows from one retry to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    /// `base_delay` before every retry.
    Constant,
    /// `base_delay`, doubled per retry, capped at `max_delay`.
    #[default]
    Doubling,
}

impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constant" | "fixed" => Ok(Backoff::Constant),
            "doubling" | "exponential" => Ok(Backoff::Doubling),
            other => Err(format!("unknown backoff {other:?}, expected constant or doubling")),
        }
    }
}

/// How often and how patiently upstream calls are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Fraction of the delay each wait may move up or down.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// 1s, 2s, 4s, 8s, 16s.
    fn default() -> Self {
        Self::exponential(5, Duration::from_secs(1), Duration::from_secs(16))
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff: Backoff::Doubling,
            jitter: 0.1,
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            backoff: Backoff::Constant,
            jitter: 0.0,
        }
    }

    /// Wait before retry number `retry` (1-based).
    ///
    /// Jitter is derived from the retry number, so a schedule is reproducible.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let delay = match self.backoff {
            Backoff::Constant => self.base_delay,
            Backoff::Doubling => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
        .min(self.max_delay);

        if self.jitter <= 0.0 {
            return delay;
        }
        let swing = f64::from(retry.wrapping_mul(17) % 100) / 50.0 - 1.0;
        let secs = delay.as_secs_f64() * (1.0 + self.jitter * swing);
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(delay)
    }

    pub fn allows_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

/// Classification of failures the rate limiter may retry.
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Server-provided minimum wait, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Why [`RateLimiter::with_retry`] gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("{0}")]
    Permanent(E),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("cancelled while waiting for upstream")]
    Cancelled,
}

/// Retries transient upstream failures with backoff.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    policy: RetryPolicy,
}

impl RateLimiter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, retrying while its error is transient.
    ///
    /// The wait before retry `n` is the larger of the policy delay and the
    /// server's `Retry-After`. Both the call and the wait race `cancel`.
    pub async fn with_retry<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = op() => outcome,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(RetryError::Permanent(err)),
                Err(err) => err,
            };

            if !self.policy.allows_retry(attempt - 1) {
                warn!(attempt, error = %err, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self
                .policy
                .delay_for_retry(attempt)
                .max(err.retry_after().unwrap_or_default());
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient upstream failure; backing off"
            );
            self.sleep(delay, cancel)
                .await
                .map_err(|_| RetryError::Cancelled)?;
        }
    }

    /// Cooperative delay that ends early on cancellation.
    pub async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Interrupted> {
        cancellable_sleep(duration, cancel).await
    }
}
