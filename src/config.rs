//! Runtime configuration.
//!
//! Every knob has a default matching the documented behavior of the
//! pipeline; overrides come from `FORGEWATCH_*` environment variables or an
//! optional JSON file. Validation failures abort startup.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the upstream events API.
    pub upstream_url: String,
    /// Region tag used in the shared rate-limit cache key.
    pub region: String,
    /// Number of cooperating poller instances sharing the quota.
    pub active_pollers: u32,
    /// Poll cadence when the token bucket permits.
    pub poll_interval_ms: u64,
    /// Maximum items per page request.
    pub page_size: u32,

    /// Maximum batch size for the stream processor.
    pub batch_max: usize,
    /// Maximum accumulation latency before a partial batch is processed.
    pub batch_max_wait_ms: u64,
    /// Number of actor-sharded worker lanes.
    pub lanes: usize,

    /// Baseline learning rate for profile EWMA updates.
    pub ewma_alpha: f64,
    /// Samples required before statistical scoring replaces heuristics.
    pub warm_n: u64,
    /// Samples required before the multivariate test is attempted.
    pub mvn_n: u64,

    pub burst_window_min: i64,
    pub burst_min_count: usize,
    pub burst_min_rate: f64,

    pub coord_window_min: i64,
    pub coord_min_actors: usize,
    pub coord_min_events: usize,

    /// Minimum final score to persist an anomaly record.
    pub report_floor: f64,
    /// Fraction of low-priority events kept by the sampling filter.
    pub priority_sample_low: f64,

    pub detector_timeout_ms: u64,
    pub event_timeout_ms: u64,
    pub batch_timeout_ms: u64,

    /// TTL of the short-term seen-set used for deduplication.
    pub dedup_ttl_min: i64,

    /// Capacity of each priority lane in the event queue.
    pub queue_capacity: usize,
    /// How long an enqueue may block before backpressure drops kick in.
    pub enqueue_wait_ms: u64,

    /// Bound on cached profiles across the profile store.
    pub profile_cache_max: usize,
    /// Days a profile is retained after its last observation.
    pub profile_ttl_days: i64,
    /// TTL of the cached repository criticality score.
    pub criticality_ttl_min: i64,

    /// Consecutive failures before the poller circuit breaker trips.
    pub breaker_failure_limit: u32,
    pub breaker_cooldown_ms: u64,

    /// Bind address of the admin surface (health, metrics, stats).
    pub admin_addr: String,
    /// Directory for the JSONL anomaly audit log; empty disables it.
    pub audit_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_url: "https://api.github.com/events".to_string(),
            region: "default".to_string(),
            active_pollers: 1,
            poll_interval_ms: 1_000,
            page_size: 100,

            batch_max: 50,
            batch_max_wait_ms: 500,
            lanes: 8,

            ewma_alpha: 0.05,
            warm_n: 10,
            mvn_n: 30,

            burst_window_min: 5,
            burst_min_count: 5,
            burst_min_rate: 2.0,

            coord_window_min: 10,
            coord_min_actors: 3,
            coord_min_events: 10,

            report_floor: 0.15,
            priority_sample_low: 0.20,

            detector_timeout_ms: 2_000,
            event_timeout_ms: 5_000,
            batch_timeout_ms: 30_000,

            dedup_ttl_min: 10,

            queue_capacity: 10_000,
            enqueue_wait_ms: 5_000,

            profile_cache_max: 50_000,
            profile_ttl_days: 30,
            criticality_ttl_min: 10,

            breaker_failure_limit: 10,
            breaker_cooldown_ms: 30_000,

            admin_addr: "0.0.0.0:9400".to_string(),
            audit_dir: String::new(),
        }
    }
}

impl Config {
    /// Load defaults, then apply environment overrides, then validate.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(path) = std::env::var("FORGEWATCH_CONFIG") {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("cannot read {path}: {e}")))?;
            config = serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("cannot parse {path}: {e}")))?;
        }

        env_override_str("FORGEWATCH_UPSTREAM_URL", &mut config.upstream_url);
        env_override_str("FORGEWATCH_REGION", &mut config.region);
        env_override_str("FORGEWATCH_ADMIN_ADDR", &mut config.admin_addr);
        env_override_str("FORGEWATCH_AUDIT_DIR", &mut config.audit_dir);
        env_override("FORGEWATCH_ACTIVE_POLLERS", &mut config.active_pollers)?;
        env_override("FORGEWATCH_BATCH_MAX", &mut config.batch_max)?;
        env_override("FORGEWATCH_BATCH_MAX_WAIT_MS", &mut config.batch_max_wait_ms)?;
        env_override("FORGEWATCH_LANES", &mut config.lanes)?;
        env_override("FORGEWATCH_EWMA_ALPHA", &mut config.ewma_alpha)?;
        env_override("FORGEWATCH_REPORT_FLOOR", &mut config.report_floor)?;
        env_override("FORGEWATCH_QUEUE_CAPACITY", &mut config.queue_capacity)?;
        env_override("FORGEWATCH_PROFILE_CACHE_MAX", &mut config.profile_cache_max)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.upstream_url.is_empty() {
            return Err(Error::Config("upstream_url must not be empty".into()));
        }
        if self.active_pollers == 0 {
            return Err(Error::Config("active_pollers must be >= 1".into()));
        }
        if self.batch_max == 0 || self.batch_max > 1_000 {
            return Err(Error::Config("batch_max must be in 1..=1000".into()));
        }
        if self.lanes == 0 {
            return Err(Error::Config("lanes must be >= 1".into()));
        }
        if !(0.0..1.0).contains(&self.ewma_alpha) || self.ewma_alpha == 0.0 {
            return Err(Error::Config("ewma_alpha must be in (0, 1)".into()));
        }
        if !(0.0..=1.0).contains(&self.report_floor) {
            return Err(Error::Config("report_floor must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.priority_sample_low) {
            return Err(Error::Config("priority_sample_low must be in [0, 1]".into()));
        }
        if self.warm_n > self.mvn_n {
            return Err(Error::Config("warm_n must not exceed mvn_n".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be >= 1".into()));
        }
        Ok(())
    }

    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.batch_max_wait_ms)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_millis(self.detector_timeout_ms)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms)
    }
}

fn env_override_str(key: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *slot = v;
    }
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<()> {
    if let Ok(v) = std::env::var(key) {
        *slot = v
            .parse()
            .map_err(|_| Error::Config(format!("{key}={v} is not a valid value")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_documented_defaults() {
        let c = Config::default();
        assert_eq!(c.batch_max, 50);
        assert_eq!(c.batch_max_wait_ms, 500);
        assert_eq!(c.ewma_alpha, 0.05);
        assert_eq!(c.warm_n, 10);
        assert_eq!(c.mvn_n, 30);
        assert_eq!(c.report_floor, 0.15);
        assert_eq!(c.priority_sample_low, 0.20);
        assert_eq!(c.detector_timeout_ms, 2_000);
        assert_eq!(c.dedup_ttl_min, 10);
    }

    #[test]
    fn test_rejects_zero_alpha() {
        let mut c = Config::default();
        c.ewma_alpha = 0.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_warmup_thresholds() {
        let mut c = Config::default();
        c.warm_n = 100;
        c.mvn_n = 30;
        assert!(c.validate().is_err());
    }
}
