//! One retry policy for every retried call site.
//!
//! Session startup, membership fetches and any future retried operation all
//! go through [`RetryPolicy::run`] instead of growing their own attempt
//! loops. The policy owns the attempt count, the delay shape and the
//! structured logging around each retry.

use std::future::Future;
use std::time::Duration;

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed,
    /// Delay grows as `base * attempt`.
    Linear,
    /// Delay doubles after each failed attempt, capped at 30s.
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

const MAX_BACKOFF: Duration = Duration::from_secs(30);

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay to sleep after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1))),
        };
        delay.min(MAX_BACKOFF)
    }

    /// Drive `op` until it succeeds or `max_attempts` are exhausted.
    ///
    /// Returns the first success immediately; on exhaustion returns the last
    /// error with the attempt count attached as context.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(op = label, attempt, "recovered after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt < attempts {
                        let wait = self.delay_for(attempt);
                        tracing::warn!(
                            op = label,
                            attempt,
                            backoff_ms = wait.as_millis() as u64,
                            "attempt failed, retrying: {e}"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        let cause = last_err.unwrap_or_else(|| anyhow::anyhow!("no attempt was executed"));
        Err(cause.context(format!("{label} failed after {attempts} attempt(s)")))
    }
}
