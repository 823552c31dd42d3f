//! Per-key fixed-window rate limiter (spec.md §4.C).
//!
//! No direct teacher analog — the teacher has no rate limiter — but built in
//! its idiom: a small `Clone`-able struct wrapping a `tokio::sync::Mutex`
//! guarded map, the same sharing pattern as `Arc<Semaphore>`/`Arc<HandlerConfig>`
//! in `handler/mod.rs`.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

struct WindowCounter {
    remaining: u32,
    reset_at: DateTime<Utc>,
}

/// Shared, cheaply-cloned rate limiter. Multiple relay processes sharing one
/// backing store (spec.md §4.C: "Backing store is shared across relay
/// processes to be correct under horizontal scaling") would swap the
/// in-process `Mutex<HashMap<..>>` below for a Redis/etcd-backed store behind
/// the same `get` signature; this in-memory version is the single-process
/// instance of that contract.
#[derive(Clone)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    counters: Arc<Mutex<HashMap<String, WindowCounter>>>,
}

/// Outcome of a single rate-limit check.
pub struct RateLimitStatus {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitStatus {
    pub fn is_exceeded(&self) -> bool {
        self.remaining == 0
    }

    /// Human-readable retry hint for the 451 reply, e.g. "59 minutes".
    pub fn retry_hint(&self, now: DateTime<Utc>) -> String {
        let remaining = self.reset_at - now;
        let minutes = remaining.num_minutes().max(0);
        if minutes <= 1 {
            let seconds = remaining.num_seconds().max(1);
            format!("{seconds} seconds")
        } else {
            format!("{minutes} minutes")
        }
    }
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Atomically increment the counter for `key` in the current window and
    /// return the remaining quota. Caller rejects when `remaining == 0`.
    pub async fn get(&self, key: &str) -> RateLimitStatus {
        let now = Utc::now();
        let mut counters = self.counters.lock().await;

        let counter = counters.entry(key.to_string()).or_insert_with(|| WindowCounter {
            remaining: self.max,
            reset_at: now + chrono::Duration::from_std(self.window).unwrap_or_default(),
        });

        if now >= counter.reset_at {
            counter.remaining = self.max;
            counter.reset_at = now + chrono::Duration::from_std(self.window).unwrap_or_default();
        }

        let remaining = counter.remaining;
        if remaining > 0 {
            counter.remaining -= 1;
        }

        RateLimitStatus {
            remaining,
            reset_at: counter.reset_at,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_max_then_rejects() {
        let limiter = RateLimiter::new(2, Duration::from_secs(3600));

        let first = limiter.get("sender@example.com").await;
        assert!(!first.is_exceeded());

        let second = limiter.get("sender@example.com").await;
        assert!(!second.is_exceeded());

        let third = limiter.get("sender@example.com").await;
        assert!(third.is_exceeded());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(3600));

        assert!(!limiter.get("a@example.com").await.is_exceeded());
        assert!(!limiter.get("b@example.com").await.is_exceeded());
        assert!(limiter.get("a@example.com").await.is_exceeded());
    }

    #[tokio::test]
    async fn window_resets_after_expiry() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));

        assert!(!limiter.get("sender@example.com").await.is_exceeded());
        assert!(limiter.get("sender@example.com").await.is_exceeded());

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!limiter.get("sender@example.com").await.is_exceeded());
    }
}
