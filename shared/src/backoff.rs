//! Retry schedule for connect attempts
//!
//! A schedule is a precomputed, finite list of delays. Attempt `n` that fails
//! waits `delays[n]` before attempt `n + 1`; the last delay is never slept
//! because the schedule is exhausted at that point.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    /// Doubling delays starting at `initial`, capped at `max`, one per attempt
    pub fn exponential(initial: Duration, max: Duration, attempts: usize) -> Self {
        let mut delays = Vec::with_capacity(attempts);
        let mut delay = initial;
        for _ in 0..attempts {
            delays.push(delay);
            delay = std::cmp::min(delay.saturating_mul(2), max);
        }
        Self { delays }
    }

    /// Schedule from explicit delays
    pub fn from_delays(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Number of attempts this schedule allows
    pub fn attempts(&self) -> usize {
        self.delays.len()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Delay to wait after failed attempt `attempt` (zero-based), or `None`
    /// if that attempt was the last one
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        if attempt + 1 >= self.delays.len() {
            return None;
        }
        self.delays.get(attempt).copied()
    }
}
