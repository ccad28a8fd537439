//! Per-actor and per-repository baselines.
//!
//! User baselines are mean/variance vectors over the behavioral feature
//! space, updated by EWMA in the hot path and never recomputed from
//! scratch. A covariance estimate rides along for the multivariate test;
//! its inverse is rebuilt lazily once the profile has enough samples.

use crate::algo::matrix;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Dimensionality of the behavioral feature space.
pub const FEATURE_DIM: usize = 10;

pub type FeatureVec = [f64; FEATURE_DIM];

/// Lower bound applied to every variance dimension.
pub const VARIANCE_FLOOR: f64 = 1e-6;

/// Rebuild the cached inverse covariance at most once per this many
/// observations.
const INVERSE_REBUILD_INTERVAL: u32 = 32;

pub const FEATURE_NAMES: [&str; FEATURE_DIM] = [
    "events_per_hour",
    "repository_diversity_ratio",
    "avg_inter_event_interval_minutes",
    "commit_message_length_avg",
    "files_changed_per_commit_avg",
    "activity_burst_score",
    "time_spread_hours",
    "event_type_entropy",
    "weekend_activity_ratio",
    "off_hours_activity_ratio",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub mean: FeatureVec,
    pub variance: FeatureVec,
    /// Samples folded into the baseline. Monotonically non-decreasing.
    pub n: u64,
    pub last_update: DateTime<Utc>,
    /// Observed event-type counts, used by the pre-filter.
    pub event_type_counts: HashMap<String, u64>,
    covariance: [[f64; FEATURE_DIM]; FEATURE_DIM],
    #[serde(skip)]
    inverse_covariance: Option<[[f64; FEATURE_DIM]; FEATURE_DIM]>,
    #[serde(skip)]
    observations_since_inverse: u32,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            mean: [0.0; FEATURE_DIM],
            variance: [VARIANCE_FLOOR; FEATURE_DIM],
            n: 0,
            last_update: DateTime::<Utc>::UNIX_EPOCH,
            event_type_counts: HashMap::new(),
            covariance: [[0.0; FEATURE_DIM]; FEATURE_DIM],
            inverse_covariance: None,
            observations_since_inverse: 0,
        }
    }
}

impl UserProfile {
    /// Fold one feature vector into the baseline.
    ///
    /// `mu' = a*x + (1-a)*mu`, `var' = a*(x-mu')^2 + (1-a)*var`, variance
    /// floored at `VARIANCE_FLOOR`, `n` incremented by exactly one.
    pub fn observe(&mut self, x: &FeatureVec, alpha: f64, ts: DateTime<Utc>) {
        if self.n == 0 {
            self.mean = *x;
            for v in self.variance.iter_mut() {
                *v = VARIANCE_FLOOR;
            }
        } else {
            let mut delta = [0.0; FEATURE_DIM];
            for i in 0..FEATURE_DIM {
                self.mean[i] = alpha * x[i] + (1.0 - alpha) * self.mean[i];
                delta[i] = x[i] - self.mean[i];
                let v = alpha * delta[i] * delta[i] + (1.0 - alpha) * self.variance[i];
                self.variance[i] = v.max(VARIANCE_FLOOR);
            }
            for i in 0..FEATURE_DIM {
                for j in 0..FEATURE_DIM {
                    self.covariance[i][j] =
                        alpha * delta[i] * delta[j] + (1.0 - alpha) * self.covariance[i][j];
                }
            }
        }
        self.n += 1;
        self.observations_since_inverse = self.observations_since_inverse.saturating_add(1);
        self.last_update = ts;
    }

    pub fn record_event_type(&mut self, kind: &str) {
        *self.event_type_counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Share of this actor's observed events with the given type tag.
    pub fn type_share(&self, kind: &str) -> f64 {
        let total: u64 = self.event_type_counts.values().sum();
        if total == 0 {
            return 0.0;
        }
        *self.event_type_counts.get(kind).unwrap_or(&0) as f64 / total as f64
    }

    /// Inverse covariance for the multivariate test, rebuilt lazily.
    ///
    /// Returns `None` while the profile has fewer than `mvn_n` samples or
    /// when the covariance estimate is not invertible.
    pub fn inverse_covariance(
        &mut self,
        mvn_n: u64,
    ) -> Option<&[[f64; FEATURE_DIM]; FEATURE_DIM]> {
        if self.n < mvn_n {
            return None;
        }
        let stale = self.inverse_covariance.is_none()
            || self.observations_since_inverse >= INVERSE_REBUILD_INTERVAL;
        if stale {
            let mut cov = self.covariance;
            for (i, row) in cov.iter_mut().enumerate() {
                row[i] = row[i].max(self.variance[i]).max(VARIANCE_FLOOR);
            }
            self.inverse_covariance = matrix::invert(&cov, 1e-6);
            self.observations_since_inverse = 0;
        }
        self.inverse_covariance.as_ref()
    }

    /// Whether the multivariate cache is currently populated.
    pub fn has_cached_inverse(&self) -> bool {
        self.inverse_covariance.is_some()
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ttl_days: i64) -> bool {
        self.n > 0 && now - self.last_update > Duration::days(ttl_days)
    }
}

/// Cached criticality with its computation time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CachedCriticality {
    pub value: f64,
    pub computed_at: DateTime<Utc>,
}

/// Per-repository baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoProfile {
    /// Exponentially decayed events-per-hour estimate.
    pub events_per_hour: f64,
    /// Smoothed contributor-set size estimate.
    pub contributors: f64,
    /// Stars observed on the stream (watch events).
    pub watch_count: u64,
    /// Forks observed on the stream.
    pub fork_count: u64,
    /// Fast-decaying popularity rate (events/hour over ~1 h).
    pub popularity_fast: f64,
    /// Slow-decaying popularity rate (events/hour over ~7 d).
    pub popularity_slow: f64,
    /// Share of recent pushes touching dependency manifests.
    pub dependency_touch_ratio: f64,
    /// Whether a security policy is known to exist; unknown on the public
    /// stream unless an enrichment source fills it in.
    pub security_policy: Option<bool>,
    pub protected_branches: u32,
    pub criticality: Option<CachedCriticality>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for RepoProfile {
    fn default() -> Self {
        Self {
            events_per_hour: 0.0,
            contributors: 0.0,
            watch_count: 0,
            fork_count: 0,
            popularity_fast: 0.0,
            popularity_slow: 0.0,
            dependency_touch_ratio: 0.0,
            security_policy: None,
            protected_branches: 0,
            criticality: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// One observation applied to a repository baseline.
#[derive(Debug, Clone, Default)]
pub struct RepoTouch {
    pub ts: DateTime<Utc>,
    /// Distinct actors seen in the repo's recent window.
    pub distinct_actors_recent: u32,
    /// Watch/star/fork events signal popularity.
    pub popularity_event: bool,
    pub fork_event: bool,
    /// Push touched a dependency manifest (Cargo.toml, package.json, ...).
    pub dependency_manifest_touch: bool,
    /// Fresh criticality computed this cycle, if any.
    pub criticality: Option<f64>,
}

impl RepoProfile {
    /// Fold one event into the decayed rate estimates.
    pub fn observe(&mut self, touch: &RepoTouch, contributor_alpha: f64) {
        if self.created_at == DateTime::<Utc>::UNIX_EPOCH {
            self.created_at = touch.ts;
            self.events_per_hour = 1.0;
        } else {
            let dt_hours = (touch.ts - self.updated_at).num_milliseconds().max(0) as f64
                / 3_600_000.0;
            self.events_per_hour = decayed_rate(self.events_per_hour, dt_hours, 1.0) + 1.0;
            self.popularity_fast = decayed_rate(self.popularity_fast, dt_hours, 1.0);
            self.popularity_slow = decayed_rate(self.popularity_slow, dt_hours, 168.0);
        }

        if touch.popularity_event {
            self.popularity_fast += 1.0;
            self.popularity_slow += 1.0;
            if touch.fork_event {
                self.fork_count += 1;
            } else {
                self.watch_count += 1;
            }
        }

        self.contributors = contributor_alpha * touch.distinct_actors_recent as f64
            + (1.0 - contributor_alpha) * self.contributors;

        let dep = if touch.dependency_manifest_touch { 1.0 } else { 0.0 };
        self.dependency_touch_ratio =
            contributor_alpha * dep + (1.0 - contributor_alpha) * self.dependency_touch_ratio;

        if let Some(value) = touch.criticality {
            self.criticality = Some(CachedCriticality { value, computed_at: touch.ts });
        }

        self.updated_at = touch.ts;
    }

    /// Cached criticality if still inside its TTL.
    pub fn fresh_criticality(&self, now: DateTime<Utc>, ttl_min: i64) -> Option<f64> {
        self.criticality
            .filter(|c| now - c.computed_at <= Duration::minutes(ttl_min))
            .map(|c| c.value)
    }
}

fn decayed_rate(rate: f64, dt_hours: f64, window_hours: f64) -> f64 {
    if dt_hours <= 0.0 {
        return rate;
    }
    rate * (-dt_hours / window_hours).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    #[test]
    fn test_first_observation_seeds_mean() {
        let mut p = UserProfile::default();
        let x = [1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        p.observe(&x, 0.05, ts(10));
        assert_eq!(p.n, 1);
        assert_eq!(p.mean[0], 1.0);
        assert_eq!(p.mean[1], 2.0);
        assert!(p.variance.iter().all(|&v| v >= VARIANCE_FLOOR));
    }

    #[test]
    fn test_ewma_update_matches_formula() {
        let mut p = UserProfile::default();
        let zero = [0.0; FEATURE_DIM];
        p.observe(&zero, 0.05, ts(0));

        let mut x = [0.0; FEATURE_DIM];
        x[0] = 10.0;
        p.observe(&x, 0.05, ts(60));

        // mu' = 0.05*10 + 0.95*0 = 0.5
        assert!((p.mean[0] - 0.5).abs() < 1e-12);
        // var' = 0.05*(10-0.5)^2 + 0.95*1e-6
        let expected = 0.05 * 9.5 * 9.5 + 0.95 * VARIANCE_FLOOR;
        assert!((p.variance[0] - expected).abs() < 1e-9);
        assert_eq!(p.n, 2);
    }

    #[test]
    fn test_n_monotone_and_variance_floored() {
        let mut p = UserProfile::default();
        let x = [3.0; FEATURE_DIM];
        for i in 0..100 {
            p.observe(&x, 0.05, ts(i));
        }
        // Constant input collapses variance toward the floor, never below.
        assert_eq!(p.n, 100);
        assert!(p.variance.iter().all(|&v| v >= VARIANCE_FLOOR));
    }

    #[test]
    fn test_inverse_waits_for_mvn_threshold() {
        let mut p = UserProfile::default();
        let x = [1.0; FEATURE_DIM];
        for i in 0..10 {
            p.observe(&x, 0.05, ts(i));
        }
        assert!(p.inverse_covariance(30).is_none());

        let mut spread = x;
        for i in 10..40 {
            spread[0] = (i % 7) as f64;
            spread[3] = (i % 3) as f64;
            p.observe(&spread, 0.05, ts(i as i64));
        }
        assert!(p.inverse_covariance(30).is_some());
    }

    #[test]
    fn test_type_share() {
        let mut p = UserProfile::default();
        for _ in 0..8 {
            p.record_event_type("PushEvent");
        }
        p.record_event_type("WatchEvent");
        p.record_event_type("ForkEvent");
        assert!((p.type_share("PushEvent") - 0.8).abs() < 1e-12);
        assert_eq!(p.type_share("IssuesEvent"), 0.0);
    }

    #[test]
    fn test_repo_rate_decays() {
        let mut r = RepoProfile::default();
        let touch = RepoTouch { ts: ts(0), distinct_actors_recent: 1, ..Default::default() };
        r.observe(&touch, 0.1);
        for i in 1..=10 {
            let touch = RepoTouch {
                ts: ts(i * 60),
                distinct_actors_recent: 1,
                ..Default::default()
            };
            r.observe(&touch, 0.1);
        }
        let busy = r.events_per_hour;
        assert!(busy > 5.0);

        // A long quiet gap decays the estimate sharply.
        let touch = RepoTouch {
            ts: ts(10 * 60 + 24 * 3600),
            distinct_actors_recent: 1,
            ..Default::default()
        };
        r.observe(&touch, 0.1);
        assert!(r.events_per_hour < 2.0);
    }

    #[test]
    fn test_criticality_cache_ttl() {
        let mut r = RepoProfile::default();
        let touch = RepoTouch {
            ts: ts(0),
            distinct_actors_recent: 1,
            criticality: Some(0.7),
            ..Default::default()
        };
        r.observe(&touch, 0.1);
        assert_eq!(r.fresh_criticality(ts(5 * 60), 10), Some(0.7));
        assert_eq!(r.fresh_criticality(ts(20 * 60), 10), None);
    }
}
