//! Shared rate-limit bookkeeping.
//!
//! Peer pollers coordinate through a shared cache entry keyed by region.
//! Writes are compare-and-set with last-writer-wins by observation time, so
//! a stale poller can never roll the quota view backwards. Each poller then
//! budgets itself an equal share of whatever remains via a token bucket.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Cache key for a region's poller quota entry.
pub fn poller_key(region: &str) -> String {
    format!("ratelimit:poller:{region}")
}

/// One observation of the upstream quota headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaObservation {
    pub remaining: u64,
    pub reset_unix: u64,
    /// Wall-clock milliseconds when the headers were read.
    pub observed_at_ms: u64,
}

/// Shared quota cache. In a multi-node deployment this sits in an external
/// cache; the semantics here are the contract either way.
#[derive(Debug, Default)]
pub struct RateLimitCache {
    entries: RwLock<HashMap<String, QuotaObservation>>,
}

impl RateLimitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare-and-set: applies the observation only when it is at least as
    /// fresh as the stored one. Returns whether it was applied.
    pub fn update(&self, key: &str, obs: QuotaObservation) -> bool {
        let mut entries = self.entries.write().unwrap();
        match entries.get(key) {
            Some(current) if current.observed_at_ms > obs.observed_at_ms => false,
            _ => {
                entries.insert(key.to_string(), obs);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<QuotaObservation> {
        self.entries.read().unwrap().get(key).copied()
    }
}

/// In-process token bucket sized to this poller's share of the remaining
/// quota. Refills linearly toward the next quota reset.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new() -> Self {
        // Until the first quota headers arrive, pace at one request per
        // second rather than stalling.
        Self {
            tokens: 1.0,
            capacity: 1.0,
            refill_per_sec: 1.0,
            last_refill: Instant::now(),
        }
    }

    /// Hand the bucket tokens outside the refill schedule, e.g. one probe
    /// after a quota reset has passed.
    pub fn grant(&mut self, tokens: f64) {
        self.capacity = self.capacity.max(1.0);
        self.tokens = (self.tokens + tokens).min(self.capacity);
    }

    /// Resize to `remaining / active_pollers`, spread over the seconds left
    /// until the quota resets.
    pub fn resize(&mut self, remaining: u64, active_pollers: u32, secs_to_reset: u64) {
        let share = remaining as f64 / active_pollers.max(1) as f64;
        self.capacity = share.max(1.0);
        self.tokens = self.tokens.min(self.capacity);
        self.refill_per_sec = if secs_to_reset > 0 {
            share / secs_to_reset as f64
        } else {
            share
        };
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    }

    /// Take one token if available.
    pub fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token will be available; zero when one already is.
    pub fn time_to_token(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.refill_per_sec <= 0.0 {
            // No refill scheduled; caller should wait for the next reset.
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new()
    }
}
