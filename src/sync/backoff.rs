// SPDX-License-Identifier: MIT
//! Exponential backoff schedule for retrying durable writes.
//!
//! The snapshot writer retries storage failures without ever touching the
//! broadcast path, so the schedule is pulled one delay at a time from a
//! small stateful iterator rather than wrapped around a closure.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied after each retry.
    pub multiplier: f64,
    /// Retries after the initial attempt; `None` = unbounded (the snapshot
    /// writer keeps trying until the task is evicted or shut down).
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: None,
        }
    }
}

impl BackoffConfig {
    /// Millisecond-scale delays for tests.
    pub fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_retries: Some(5),
        }
    }
}

/// One retry sequence. Create a fresh `Backoff` per failing operation;
/// drop it on success.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    next_delay: Duration,
    retries: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            next_delay: config.initial_delay,
            retries: 0,
        }
    }

    /// The delay to sleep before the next retry, or `None` when the retry
    /// budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_retries {
            if self.retries >= max {
                return None;
            }
        }
        self.retries += 1;
        let delay = self.next_delay;
        let scaled = (delay.as_millis() as f64 * self.config.multiplier) as u64;
        self.next_delay = Duration::from_millis(scaled).min(self.config.max_delay);
        Some(delay)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            max_retries: None,
        };
        let mut backoff = Backoff::new(&config);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(350)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(350)));
    }

    #[test]
    fn bounded_budget_runs_out() {
        let config = BackoffConfig {
            max_retries: Some(2),
            ..BackoffConfig::fast()
        };
        let mut backoff = Backoff::new(&config);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.retries(), 2);
    }
}
