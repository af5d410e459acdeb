//! Process-wide byte-rate limiter.
//!
//! A token bucket sized in bytes: every chunk read acquires its byte count
//! before the chunk goes on the wire, capping aggregate upload throughput
//! across all in-flight files. A rate of zero disables limiting.

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

pub struct RateLimiter {
    /// Bytes per second; 0 = unlimited.
    rate: u64,
    burst: u64,
    state: Mutex<State>,
}

struct State {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        // Burst of one second's worth so a single chunk never deadlocks.
        Self::with_burst(bytes_per_sec, bytes_per_sec)
    }

    pub fn with_burst(bytes_per_sec: u64, burst: u64) -> Self {
        Self {
            rate: bytes_per_sec,
            burst: burst.max(1),
            state: Mutex::new(State {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Wait until `n` bytes of budget are available, then consume them.
    /// Requests larger than the burst are allowed through in one go once
    /// the bucket is full; they simply drive the balance negative-free by
    /// waiting proportionally longer.
    pub async fn acquire(&self, n: u64) {
        if self.rate == 0 || n == 0 {
            return;
        }
        let n = n.min(self.burst) as f64;
        loop {
            let wait = {
                let mut st = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(st.last).as_secs_f64();
                st.tokens = (st.tokens + elapsed * self.rate as f64).min(self.burst as f64);
                st.last = now;
                if st.tokens >= n {
                    st.tokens -= n;
                    return;
                }
                Duration::from_secs_f64((n - st.tokens) / self.rate as f64)
            };
            sleep(wait).await;
        }
    }
}
