//! Time-bounded seen-set for event ids.
//!
//! Membership is eventually consistent across pollers; a duplicate costs
//! one extra processing cycle downstream but never a double publish, since
//! record writes are idempotent on event id.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use xxhash_rust::xxh3::xxh3_64;

/// Prune expired entries at most this often.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct DedupSet {
    seen: HashMap<u64, Instant>,
    ttl: Duration,
    last_prune: Instant,
}

impl DedupSet {
    pub fn new(ttl: Duration) -> Self {
        Self { seen: HashMap::new(), ttl, last_prune: Instant::now() }
    }

    /// Record an id; returns `true` when it was not already present.
    pub fn insert(&mut self, event_id: &str) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_prune) >= PRUNE_INTERVAL {
            self.prune(now);
        }

        let key = xxh3_64(event_id.as_bytes());
        match self.seen.get(&key) {
            Some(&at) if now.duration_since(at) < self.ttl => false,
            _ => {
                self.seen.insert(key, now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.seen.retain(|_, at| now.duration_since(*at) < ttl);
        self.last_prune = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_ttl_rejected() {
        let mut set = DedupSet::new(Duration::from_secs(600));
        assert!(set.insert("30000000001"));
        assert!(!set.insert("30000000001"));
        assert!(set.insert("30000000002"));
    }

    #[test]
    fn test_expired_entry_readmitted() {
        let mut set = DedupSet::new(Duration::ZERO);
        assert!(set.insert("x"));
        // TTL of zero expires immediately.
        assert!(set.insert("x"));
    }
}
