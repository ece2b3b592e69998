//! Bounded exponential backoff shared by every chain call and every applied
//! log.

use rand::Rng;
use std::{fmt::Display, future::Future, time::Duration};
use tokio::time;

/// Retry policy: attempt `n` (zero based) that fails is followed by a delay of
/// `base_delay * 2^n`, optionally stretched by up to a quarter for jitter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Returns the delay that follows the failed attempt with the specified
    /// zero-based index, excluding jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)))
    }

    fn delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.jitter {
            return delay;
        }
        let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=spread);
        delay + Duration::from_millis(jitter)
    }

    /// Runs `op` until it succeeds or `max_attempts` attempts have failed, in
    /// which case the last error is returned.
    pub async fn execute<F, Fut, T, E>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= attempts => return Err(err),
                Err(err) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        %label, attempt = attempt + 1, max_attempts = attempts, ?delay, %err,
                        "retrying after error"
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
