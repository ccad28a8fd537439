//! Contextual (repository) detector.
//!
//! Unlike the other detectors this one does not score the event itself; it
//! produces the repository criticality multiplier the fuser applies. The
//! score equals the clipped criticality, with a qualitative level attached
//! for human consumption.

use crate::algo::clip;
use crate::detect::{Detector, DetectorContext, DetectorKind, DetectorOutput};
use crate::error::Result;
use crate::profile::RepoProfile;
use serde_json::json;

/// Baseline criticality for a repository nobody knows anything about.
const BASE_CRITICALITY: f64 = 0.05;

/// Feature weights; together with the base they sum to at most 1.
const W_STARS: f64 = 0.20;
const W_FORKS: f64 = 0.15;
const W_CONTRIBUTORS: f64 = 0.15;
const W_ACTIVITY: f64 = 0.15;
const W_SECURITY_POLICY: f64 = 0.05;
const W_PROTECTED_BRANCHES: f64 = 0.05;
const W_DEPENDENCY_RISK: f64 = 0.10;
const W_MOMENTUM: f64 = 0.10;

pub struct ContextualDetector;

impl Detector for ContextualDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Contextual
    }

    fn evaluate(&self, ctx: &DetectorContext) -> Result<DetectorOutput> {
        let mut out = DetectorOutput::empty(DetectorKind::Contextual);
        let repo = &ctx.repo;

        let features = repo_features(repo);
        let criticality = repo
            .fresh_criticality(ctx.event.created_at, ctx.params.criticality_ttl_min)
            .unwrap_or_else(|| combine(&features));

        out.score = clip(criticality, 0.0, 1.0);
        out.features = std::iter::once(out.score).chain(features.iter().copied()).collect();
        out.explanation = json!({
            "criticality": out.score,
            "level": level(out.score),
            "stars_norm": features[0],
            "forks_norm": features[1],
            "contributors_norm": features[2],
            "activity_norm": features[3],
            "security_policy": features[4],
            "protected_branches_norm": features[5],
            "dependency_risk": features[6],
            "popularity_momentum": features[7],
        });
        Ok(out)
    }
}

/// The eight normalized inputs behind the criticality score.
fn repo_features(repo: &RepoProfile) -> [f64; 8] {
    let stars = clip((1.0 + repo.watch_count as f64).log10() / 4.0, 0.0, 1.0);
    let forks = clip((1.0 + repo.fork_count as f64).log10() / 3.0, 0.0, 1.0);
    let contributors = clip((1.0 + repo.contributors).log10() / 2.0, 0.0, 1.0);
    let activity = clip((1.0 + repo.events_per_hour).log10() / 2.0, 0.0, 1.0);
    let security_policy = match repo.security_policy {
        Some(true) => 1.0,
        Some(false) => 0.0,
        None => 0.0,
    };
    let protected = clip(repo.protected_branches as f64 / 5.0, 0.0, 1.0);
    let dependency_risk = clip(repo.dependency_touch_ratio, 0.0, 1.0);

    let slow_hourly = repo.popularity_slow / 168.0;
    let momentum = if slow_hourly > 0.0 {
        clip((repo.popularity_fast / slow_hourly - 1.0) / 10.0, 0.0, 1.0)
    } else {
        clip(repo.popularity_fast / 10.0, 0.0, 1.0)
    };

    [stars, forks, contributors, activity, security_policy, protected, dependency_risk, momentum]
}

fn combine(f: &[f64; 8]) -> f64 {
    BASE_CRITICALITY
        + W_STARS * f[0]
        + W_FORKS * f[1]
        + W_CONTRIBUTORS * f[2]
        + W_ACTIVITY * f[3]
        + W_SECURITY_POLICY * f[4]
        + W_PROTECTED_BRANCHES * f[5]
        + W_DEPENDENCY_RISK * f[6]
        + W_MOMENTUM * f[7]
}

fn level(criticality: f64) -> &'static str {
    if criticality >= 0.8 {
        "critical"
    } else if criticality >= 0.6 {
        "high"
    } else if criticality >= 0.4 {
        "medium"
    } else {
        "low"
    }
}
