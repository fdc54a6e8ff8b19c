// SPDX-License-Identifier: MIT OR Apache-2.0
//! Token-bucket rate limiter capping worker throughput.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: `max_jobs` tokens refilled evenly over `window`.
///
/// The bucket starts full, so a cold worker can burst up to the cap before
/// the steady-state rate applies.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_ms: f64,
    inner: Mutex<BucketInner>,
}

impl RateLimiter {
    /// Allow `max_jobs` jobs per `window`.
    pub fn new(max_jobs: u32, window: Duration) -> Self {
        let capacity = f64::from(max_jobs.max(1));
        let window_ms = window.as_millis().max(1) as f64;
        Self {
            capacity,
            refill_per_ms: capacity / window_ms,
            inner: Mutex::new(BucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        self.refill(&mut inner);
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
                self.refill(&mut inner);
                if inner.tokens >= 1.0 {
                    inner.tokens -= 1.0;
                    return;
                }
                // Time until one full token has accumulated.
                let deficit = 1.0 - inner.tokens;
                Duration::from_millis((deficit / self.refill_per_ms).ceil() as u64)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (diagnostic).
    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock().expect("rate limiter lock poisoned");
        self.refill(&mut inner);
        inner.tokens
    }

    fn refill(&self, inner: &mut BucketInner) {
        let now = Instant::now();
        let elapsed_ms = now.duration_since(inner.last_refill).as_millis() as f64;
        inner.tokens = (inner.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        inner.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_starts_full() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn tokens_refill_over_time() {
        // 100 tokens per second => one every 10 ms.
        let limiter = RateLimiter::new(100, Duration::from_secs(1));
        while limiter.try_acquire() {}
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(35));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn refill_caps_at_capacity() {
        let limiter = RateLimiter::new(2, Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.available() <= 2.0 + f64::EPSILON);
    }

    #[tokio::test]
    async fn acquire_waits_for_a_token() {
        let limiter = RateLimiter::new(50, Duration::from_secs(1));
        while limiter.try_acquire() {}
        let started = Instant::now();
        limiter.acquire().await;
        // One token accrues every 20 ms.
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
