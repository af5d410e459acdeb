//! Retry policy with multiplicative backoff.
//!
//! Callers drive the policy as an iterator of delays so timing is testable
//! without sleeping: the policy yields the gap before each retry, and the
//! caller decides how to wait it out.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub interval: Duration,
    /// Each subsequent delay is multiplied by this factor.
    pub factor: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration, factor: u32) -> Self {
        Self {
            max_attempts,
            interval,
            factor,
        }
    }

    /// Delays between attempts; yields `max_attempts - 1` items.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            remaining: self.max_attempts.saturating_sub(1),
            next: self.interval,
            factor: self.factor.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_secs(1),
            factor: 2,
        }
    }
}

pub struct Backoff {
    remaining: u32,
    next: Duration,
    factor: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let cur = self.next;
        self.next = cur.saturating_mul(self.factor);
        Some(cur)
    }
}
