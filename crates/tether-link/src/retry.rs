//! Bounded exponential backoff for polling external state.
//!
//! [`poll_with_backoff`] keeps calling a lookup until it yields a value, the
//! attempt budget or total time budget runs out, or the token is cancelled.
//! It knows nothing about what is being polled.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total lookups, including the first immediate one.
    pub max_attempts: u32,
    /// Delay after the first failed lookup.
    pub base_delay: Duration,
    /// Growth factor applied to the delay after each failed lookup.
    pub multiplier: u32,
    /// Polling stops rather than sleep past this much elapsed time.
    pub max_total: Duration,
}

impl Default for RetryPolicy {
    /// 50, 100, 200, 400 ms between five attempts.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            multiplier: 2,
            max_total: Duration::from_millis(1500),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// All delays the policy would sleep if every lookup failed, ignoring
    /// `max_total`.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts.max(1)).map(|a| self.delay_after(a)).collect()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("no value after {attempts} attempts in {elapsed:?}")]
    Exhausted { attempts: u32, elapsed: Duration },

    #[error("polling cancelled")]
    Cancelled,
}

/// Poll `lookup` until it returns `Some`.
///
/// The first lookup runs immediately. On success returns the value and the
/// 1-based attempt that produced it.
pub async fn poll_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut lookup: F,
) -> Result<(T, u32), PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            value = lookup(attempt) => value,
        };
        if let Some(value) = outcome {
            return Ok((value, attempt));
        }

        let elapsed = started.elapsed();
        let delay = policy.delay_after(attempt);
        if attempt >= max_attempts || elapsed + delay > policy.max_total {
            return Err(PollError::Exhausted {
                attempts: attempt,
                elapsed,
            });
        }

        debug!(attempt, delay_ms = delay.as_millis() as u64, "value not ready, backing off");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
