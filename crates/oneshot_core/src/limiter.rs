/*
 * SPDX-FileCopyrightText: 2026 Oneshot Labeler Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, fill_rate: f64) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * fill_rate).min(capacity);
        self.last = now;
    }

    fn try_take(&mut self, now: Instant, capacity: f64, fill_rate: f64) -> bool {
        self.refill(now, capacity, fill_rate);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token is available, zero if one already is.
    fn wait_for_one(&self, fill_rate: f64) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / fill_rate)
    }
}

/// Single token bucket: `fill_rate` tokens per second up to `capacity`.
pub struct RateLimiter {
    capacity: f64,
    fill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(fill_rate: f64, capacity: f64) -> Self {
        Self {
            capacity,
            fill_rate,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap();
        bucket.try_take(Instant::now(), self.capacity, self.fill_rate)
    }

    /// Suspends until a token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                if bucket.try_take(Instant::now(), self.capacity, self.fill_rate) {
                    return;
                }
                bucket.wait_for_one(self.fill_rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Per-key token buckets with bounded memory: `burst` tokens per key,
/// refilled at `burst` per `window`.
pub struct KeyedRateLimiter {
    capacity: f64,
    fill_rate: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl KeyedRateLimiter {
    pub fn new(burst: u32, window: Duration) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            fill_rate: capacity / window.as_secs_f64().max(0.001),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        if !buckets.contains_key(key) && buckets.len() >= MAX_TRACKED_KEYS {
            // Full buckets carry no state worth keeping.
            let capacity = self.capacity;
            let fill_rate = self.fill_rate;
            buckets.retain(|_, b| {
                let mut probe = *b;
                probe.refill(now, capacity, fill_rate);
                probe.tokens < capacity
            });
        }
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last: now,
        });
        bucket.try_take(now, self.capacity, self.fill_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let limiter = RateLimiter::new(1.0, 2.0);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(10.0, 1.0);
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn keyed_buckets_are_independent() {
        let limiter = KeyedRateLimiter::new(3, Duration::from_secs(120));
        for _ in 0..3 {
            assert!(limiter.try_acquire("plc:alice"));
        }
        assert!(!limiter.try_acquire("plc:alice"));
        assert!(limiter.try_acquire("plc:bob"));

        // One token back after window / burst.
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(limiter.try_acquire("plc:alice"));
        assert!(!limiter.try_acquire("plc:alice"));
    }
}
