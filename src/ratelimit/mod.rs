//! Rate limiting and concurrency-cap primitives (spec.md §4.9).
//!
//! Generalized from `ipc/mod.rs::{ConnectionRateLimiter, RpcRateLimiter}`
//! in the teacher daemon — two bespoke, single-purpose limiters there
//! become the two reusable primitives this spec names, applied at every
//! call site spec.md's table lists (subscribe creation, CLI-ticket poll,
//! RPC connections per principal, PTY connections, event-stream
//! connections).

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Per-key minimum interval between successful acquisitions. Used for
/// subscribe-creation (200 ms per principal key) and CLI-ticket polling
/// (200 ms per client IP).
pub struct MinIntervalLimiter {
    min_interval: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl MinIntervalLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last: Mutex::new(HashMap::new()) }
    }

    /// `true` if `key` may proceed now (and records that it did).
    pub async fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().await;
        match last.get(key) {
            Some(prev) if now.duration_since(*prev) < self.min_interval => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop tracked keys whose last acquisition is older than `max_age` —
    /// call periodically so the map doesn't grow unboundedly under churn.
    pub async fn sweep(&self, max_age: Duration) {
        let now = Instant::now();
        self.last.lock().await.retain(|_, t| now.duration_since(*t) < max_age);
    }
}

/// Balanced acquire/release counter, global or per-key, with an optional
/// ceiling. Used for the total/per-principal subscriber caps, and the
/// mission/PTY connection caps.
pub struct CounterLimiter {
    max: Option<usize>,
    counts: Mutex<HashMap<String, usize>>,
}

impl CounterLimiter {
    pub fn new(max: Option<usize>) -> Self {
        Self { max, counts: Mutex::new(HashMap::new()) }
    }

    /// Attempts to increment `key`'s count; `false` (no-op) if at cap.
    pub async fn try_acquire(&self, key: &str) -> bool {
        let mut counts = self.counts.lock().await;
        let entry = counts.entry(key.to_string()).or_insert(0);
        if let Some(max) = self.max {
            if *entry >= max {
                return false;
            }
        }
        *entry += 1;
        true
    }

    /// Decrements `key`'s count, floored at zero (never negative).
    pub async fn release(&self, key: &str) {
        let mut counts = self.counts.lock().await;
        if let Some(entry) = counts.get_mut(key) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                counts.remove(key);
            }
        }
    }

    pub async fn count(&self, key: &str) -> usize {
        *self.counts.lock().await.get(key).unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn min_interval_limiter_blocks_within_window() {
        let limiter = MinIntervalLimiter::new(Duration::from_millis(200));
        assert!(limiter.try_acquire("k").await);
        assert!(!limiter.try_acquire("k").await);
    }

    #[tokio::test]
    async fn min_interval_limiter_is_independent_per_key() {
        let limiter = MinIntervalLimiter::new(Duration::from_millis(200));
        assert!(limiter.try_acquire("a").await);
        assert!(limiter.try_acquire("b").await);
    }

    #[tokio::test]
    async fn counter_limiter_enforces_cap_and_releases() {
        let limiter = CounterLimiter::new(Some(2));
        assert!(limiter.try_acquire("p").await);
        assert!(limiter.try_acquire("p").await);
        assert!(!limiter.try_acquire("p").await);
        limiter.release("p").await;
        assert!(limiter.try_acquire("p").await);
    }

    #[tokio::test]
    async fn counter_limiter_never_goes_negative() {
        let limiter = CounterLimiter::new(None);
        limiter.release("p").await;
        assert_eq!(limiter.count("p").await, 0);
    }
}
