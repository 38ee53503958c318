//! Retry strategies and backoff policies.
//!
//! Delay grows per the configured strategy, is capped at `max_delay`, then
//! jittered by a random multiplier to avoid thundering herds. Attempt
//! numbers are 0-based: attempt 0 is the delay before the first retry.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay every attempt
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay doubles each attempt
    #[default]
    Exponential,
    /// Delay follows the Fibonacci sequence
    Fibonacci,
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay by a multiplier drawn from `jitter_range`
    pub jitter: bool,
    pub jitter_range: (f64, f64),
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
            jitter_range: (0.5, 1.5),
        }
    }
}

impl RetryConfig {
    /// Delay before the retry following attempt `attempt` (0-based), capped
    /// and jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt + 1),
            RetryStrategy::Exponential => {
                let pow = attempt.min(16);
                self.base_delay.saturating_mul(2_u32.saturating_pow(pow))
            }
            RetryStrategy::Fibonacci => self.base_delay.saturating_mul(fibonacci(attempt)),
        };

        let capped = raw.min(self.max_delay);

        if self.jitter {
            apply_jitter(capped, self.jitter_range)
        } else {
            capped
        }
    }

    /// Run `op`, retrying every failure up to `max_retries` times.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_if(op, |_| true).await
    }

    /// Run `op`, retrying only while `should_retry` approves the error.
    pub async fn run_if<T, E, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.max_retries || !should_retry(&e) {
                        return Err(e);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// fib(0) = 1, fib(1) = 1, fib(2) = 2, ...
fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (1u32, 1u32);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

fn apply_jitter(delay: Duration, (low, high): (f64, f64)) -> Duration {
    use rand::Rng;

    let factor = rand::thread_rng().gen_range(low..=high);
    let millis = (delay.as_millis() as f64 * factor).round() as u64;
    Duration::from_millis(millis)
}
