//! Exponential backoff with full jitter
//!
//! Delay schedule for retrying OCR invocations: each failed attempt waits a
//! uniformly random slice of the current interval, the interval grows by a
//! fixed multiplier up to a cap, and the whole schedule stops once a total
//! elapsed budget is spent.

use std::time::{Duration, Instant};

use rand::Rng;

/// Backoff parameters. The defaults mirror the conventional exponential
/// schedule: 500 ms initial, x1.5 growth, 60 s interval cap, 2 min budget.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(120),
        }
    }
}

/// One retry schedule in progress.
pub struct Backoff {
    policy: BackoffPolicy,
    current_interval: Duration,
    started: Instant,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let current_interval = policy.initial_interval;
        Self {
            policy,
            current_interval,
            started: Instant::now(),
        }
    }

    /// Delay before the next attempt, or `None` once the elapsed budget is
    /// exhausted and the caller must give up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.started.elapsed() >= self.policy.max_elapsed {
            return None;
        }
        let delay = full_jitter(self.current_interval);
        self.current_interval = std::cmp::min(
            self.current_interval.mul_f64(self.policy.multiplier),
            self.policy.max_interval,
        );
        Some(delay)
    }
}

fn full_jitter(interval: Duration) -> Duration {
    interval.mul_f64(rand::thread_rng().gen::<f64>())
}
