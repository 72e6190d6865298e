//! Bounded retries with backoff.

use std::{cmp::min, future::Future, time::Duration};

use strum_macros::{Display, EnumString};
use tokio::time::sleep;
use tracing::debug;

/// How our wait between attempts grows.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum Backoff {
    /// Wait `base`, `2 * base`, `3 * base`, ...
    Linear,
    /// Wait `base`, `2 * base`, `4 * base`, ...
    Exponential,
}

/// When and how often to retry a failed request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// We never wait longer than this between attempts.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff: Backoff::Linear,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// How long should we wait after `failed_attempts` attempts have failed?
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let n = failed_attempts.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(n),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(n - 1)),
        };
        min(delay, self.max_delay)
    }

    /// Call `attempt` until it returns a value for which `should_retry` is
    /// false, or until we run out of attempts. Returns the last value and the
    /// number of attempts made.
    ///
    /// `attempt` receives the 1-based attempt number.
    pub async fn run<T, F, Fut, R>(&self, should_retry: R, mut attempt: F) -> (T, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        R: Fn(&T) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let value = attempt(attempts).await;
            if attempts >= max_attempts || !should_retry(&value) {
                return (value, attempts);
            }
            let wait = self.delay_after(attempts);
            debug!(
                "retrying after attempt {}/{} (waiting {} ms)",
                attempts,
                max_attempts,
                wait.as_millis()
            );
            sleep(wait).await;
        }
    }
}
