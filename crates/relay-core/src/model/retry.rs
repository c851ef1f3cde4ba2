use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;

use super::types::CompletionError;

/// Retry schedule for completion calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (so `max_retries + 1` attempts at most).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound applied to a server-supplied `Retry-After`.
    pub max_rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_rate_limit_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: cfg.retry_base_delay,
            max_delay: cfg.retry_max_delay.max(cfg.retry_base_delay),
            ..Self::default()
        }
    }

    /// Exponential schedule: `base * 2^(retry-1)`, capped at `max_delay`.
    /// `retry` is 1-based (the first retry waits `base_delay`).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Delay before retry number `retry`, or `None` if `err` must not be retried
    /// or the budget is spent.
    pub fn delay_for(&self, retry: u32, err: &CompletionError) -> Option<Duration> {
        if !err.is_retryable() || retry > self.max_retries {
            return None;
        }
        match err.retry_after() {
            Some(hint) => Some(hint.min(self.max_rate_limit_delay)),
            None => Some(self.backoff(retry)),
        }
    }
}

/// Delay abstraction so retry schedules are testable without real time passing.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if duration > Duration::ZERO {
            tokio::time::sleep(duration).await;
        }
    }
}
