//! Retry policies with configurable backoff.
//!
//! Used for reconnect-with-backoff inside a poll cycle, for waiting on a
//! freshly launched machine, and for the bounded final log pull.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::config::BackoffStrategy;


// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How many times an operation may be retried and how long to wait between
/// attempts. `max_retries = 0` means a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, strategy: BackoffStrategy, base_delay_ms: u64) -> Self {
        RetryPolicy {
            max_retries,
            strategy,
            base_delay_ms,
            max_delay_ms: 60_000,
        }
    }

    /// A policy that never retries.
    pub fn once() -> Self {
        RetryPolicy::new(0, BackoffStrategy::Fixed, 0)
    }

    /// Whether the given retry number (0-indexed) is within the budget.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Delay before the given retry (0 is the first retry).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(attempt as u64 + 1),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt.min(16))),
        };
        raw.min(self.max_delay_ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// budget is spent. `op` receives the attempt number (0 = first try).
    /// The last error is returned when the budget runs out.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !retryable(&err) || !self.should_retry(attempt) {
                        return Err(err);
                    }
                    let delay = self.delay_ms(attempt);
                    if delay > 0 {
                        thread::sleep(Duration::from_millis(delay));
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// 3 retries, exponential backoff, 1000ms base delay.
    fn default() -> Self {
        RetryPolicy::new(3, BackoffStrategy::Exponential, 1000)
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay() {
        let p = RetryPolicy::new(3, BackoffStrategy::Fixed, 500);
        assert_eq!(p.delay_ms(0), 500);
        assert_eq!(p.delay_ms(2), 500);
    }

    #[test]
    fn linear_delay() {
        let p = RetryPolicy::new(3, BackoffStrategy::Linear, 100);
        assert_eq!(p.delay_ms(0), 100);
        assert_eq!(p.delay_ms(1), 200);
        assert_eq!(p.delay_ms(2), 300);
    }

    #[test]
    fn exponential_delay_is_capped() {
        let mut p = RetryPolicy::new(10, BackoffStrategy::Exponential, 1000);
        assert_eq!(p.delay_ms(0), 1000);
        assert_eq!(p.delay_ms(1), 2000);
        assert_eq!(p.delay_ms(2), 4000);
        p.max_delay_ms = 5000;
        assert_eq!(p.delay_ms(3), 5000);
        assert_eq!(p.delay_ms(40), 5000);
    }

    #[test]
    fn once_never_retries() {
        let p = RetryPolicy::once();
        assert!(!p.should_retry(0));
    }

    #[test]
    fn run_retries_until_success() {
        let p = RetryPolicy::new(3, BackoffStrategy::Fixed, 0);
        let mut calls = 0;
        let result: Result<u32, String> = p.run(
            |attempt| {
                calls += 1;
                if attempt < 2 {
                    Err("flaky".into())
                } else {
                    Ok(attempt)
                }
            },
            |_| true,
        );
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn run_gives_up_after_budget() {
        let p = RetryPolicy::new(2, BackoffStrategy::Fixed, 0);
        let mut calls = 0;
        let result: Result<(), String> = p.run(
            |_| {
                calls += 1;
                Err("down".into())
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn run_stops_on_non_retryable() {
        let p = RetryPolicy::new(5, BackoffStrategy::Fixed, 0);
        let mut calls = 0;
        let result: Result<(), &str> = p.run(
            |_| {
                calls += 1;
                Err("fatal")
            },
            |e| *e != "fatal",
        );
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let p: RetryPolicy = serde_yaml::from_str("max_retries: 1\nstrategy: linear\n").unwrap();
        assert_eq!(p.max_retries, 1);
        assert_eq!(p.strategy, BackoffStrategy::Linear);
        assert_eq!(p.base_delay_ms, 1000);
    }
}
