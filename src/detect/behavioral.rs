//! Behavioral detector.
//!
//! Scores the actor's current feature vector against their EWMA baseline.
//! Warm profiles get per-dimension z-tests plus a multivariate Mahalanobis
//! test; cold profiles fall back to tiered heuristics.

use crate::algo::{clip, matrix};
use crate::algo::chisq::CRIT_DF10_P01;
use crate::detect::{Detector, DetectorAnomaly, DetectorContext, DetectorKind, DetectorOutput};
use crate::error::Result;
use crate::profile::{FEATURE_DIM, FEATURE_NAMES};
use serde_json::json;

/// Absolute z-score at which a dimension is flagged.
const Z_FLAG: f64 = 3.0;
/// Divisor mapping z-score excess onto severity.
const Z_SEVERITY_SPAN: f64 = 5.0;

pub struct BehavioralDetector;

impl Detector for BehavioralDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Behavioral
    }

    fn evaluate(&self, ctx: &DetectorContext) -> Result<DetectorOutput> {
        let x = &ctx.features;
        let mut out = DetectorOutput::empty(DetectorKind::Behavioral);
        out.features = x.to_vec();

        let warm = ctx.user.n >= ctx.params.warm_n;
        if warm {
            self.score_warm(ctx, &mut out);
        } else {
            self.score_cold(ctx, &mut out);
        }

        out.explanation = json!({
            "mode": if warm { "warm" } else { "cold" },
            "samples": ctx.user.n,
            "features": feature_map(x),
            "anomalies": out.anomalies.len(),
        });
        Ok(out)
    }
}

impl BehavioralDetector {
    fn score_warm(&self, ctx: &DetectorContext, out: &mut DetectorOutput) {
        let x = &ctx.features;
        let mut score: f64 = 0.0;

        for i in 0..FEATURE_DIM {
            let sigma = ctx.user.variance[i].sqrt();
            let z = (x[i] - ctx.user.mean[i]) / sigma;
            if z.abs() >= Z_FLAG {
                let severity = clip((z.abs() - Z_FLAG) / Z_SEVERITY_SPAN, 0.0, 1.0);
                score = score.max(severity);
                out.anomalies.push(DetectorAnomaly {
                    kind: "feature_deviation".to_string(),
                    feature: Some(FEATURE_NAMES[i].to_string()),
                    current: x[i],
                    z_score: Some(z),
                    severity,
                    location: None,
                    detail: None,
                });
            }
        }

        // Multivariate test once the covariance estimate is mature. The
        // snapshot carries the inverse the store maintains; this call
        // normally just reads it.
        let mut user = ctx.user.clone();
        if let Some(inv) = user.inverse_covariance(ctx.params.mvn_n) {
            let d2 = matrix::mahalanobis_sq(x, &ctx.user.mean, inv);
            if d2 > CRIT_DF10_P01 {
                let severity = clip(d2 / CRIT_DF10_P01 - 1.0, 0.0, 1.0);
                score = score.max(severity);
                out.anomalies.push(DetectorAnomaly {
                    kind: "multivariate_deviation".to_string(),
                    feature: None,
                    current: d2.sqrt(),
                    z_score: None,
                    severity,
                    location: None,
                    detail: Some(format!(
                        "mahalanobis^2 {:.2} over critical {:.2}",
                        d2, CRIT_DF10_P01
                    )),
                });
            }
        }

        out.score = score;
    }

    /// Tiered heuristics for profiles with too few samples for the
    /// statistical path. Combined by max.
    fn score_cold(&self, ctx: &DetectorContext, out: &mut DetectorOutput) {
        let x = &ctx.features;
        let events_per_hour = x[0];
        let avg_gap_min = x[2];
        let burst = x[5];
        let entropy = x[7];

        let flag = |severity: f64, feature: usize, detail: &str, out: &mut DetectorOutput| {
            out.anomalies.push(DetectorAnomaly {
                kind: "cold_start_heuristic".to_string(),
                feature: Some(FEATURE_NAMES[feature].to_string()),
                current: x[feature],
                z_score: None,
                severity,
                location: None,
                detail: Some(detail.to_string()),
            });
            severity
        };

        let mut score: f64 = 0.0;
        if events_per_hour >= 100.0 {
            score = score.max(flag(0.9, 0, "extreme hourly volume", out));
        } else if events_per_hour >= 50.0 {
            score = score.max(flag(0.7, 0, "very high hourly volume", out));
        } else if events_per_hour >= 20.0 {
            score = score.max(flag(0.5, 0, "high hourly volume", out));
        }

        if entropy == 0.0 && events_per_hour >= 10.0 {
            score = score.max(flag(0.6, 7, "single-type volume", out));
        }

        if burst >= 0.5 {
            score = score.max(flag(burst, 5, "activity burst", out));
        }

        if avg_gap_min > 0.0 && avg_gap_min < 0.2 && events_per_hour >= 10.0 {
            score = score.max(flag(0.6, 2, "machine-rate event cadence", out));
        }

        out.score = score;
    }
}

fn feature_map(x: &[f64; FEATURE_DIM]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (name, value) in FEATURE_NAMES.iter().zip(x.iter()) {
        map.insert(name.to_string(), json!(value));
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::detect::DetectorParams;
    use crate::event::{Actor, Event, EventType, Payload, Repo};
    use crate::history::HistorySnapshot;
    use crate::profile::{RepoProfile, UserProfile};
    use chrono::Utc;

    fn context(user: UserProfile, features: [f64; FEATURE_DIM]) -> DetectorContext {
        DetectorContext {
            event: Event {
                id: "1".into(),
                kind: EventType::Push,
                actor: Actor { id: 9, login: "dev".into() },
                repo: Repo { id: 4, name: "o/r".into(), default_branch: None },
                created_at: Utc::now(),
                payload: Payload::Push(Default::default()),
            },
            user,
            repo: RepoProfile::default(),
            history: HistorySnapshot {
                actor_events: Vec::new(),
                hour_histogram: [0.0; 24],
                hour_histogram_total: 0.0,
                repo_recent: Vec::new(),
                distinct_repo_actors: 0,
            },
            features,
            params: DetectorParams::from_config(&Config::default()),
        }
    }

    fn warm_profile(mean0: f64, var0: f64) -> UserProfile {
        let mut p = UserProfile::default();
        p.n = 50;
        p.mean[0] = mean0;
        for v in p.variance.iter_mut() {
            *v = 1.0;
        }
        p.variance[0] = var0;
        p
    }

    #[test]
    fn test_cold_quiet_actor_scores_zero() {
        let mut features = [0.0; FEATURE_DIM];
        features[0] = 1.0;
        let ctx = context(UserProfile::default(), features);
        let out = BehavioralDetector.evaluate(&ctx).unwrap();
        assert_eq!(out.score, 0.0);
        assert!(out.anomalies.is_empty());
        assert_eq!(out.explanation["mode"], "cold");
    }

    #[test]
    fn test_cold_volume_tiers() {
        for (volume, expected) in [(20.0, 0.5), (50.0, 0.7), (100.0, 0.9)] {
            let mut features = [0.0; FEATURE_DIM];
            features[0] = volume;
            // Non-zero entropy keeps the single-type rule quiet.
            features[7] = 0.7;
            let ctx = context(UserProfile::default(), features);
            let out = BehavioralDetector.evaluate(&ctx).unwrap();
            assert_eq!(out.score, expected, "volume {volume}");
        }
    }

    #[test]
    fn test_cold_zero_entropy_rule() {
        let mut features = [0.0; FEATURE_DIM];
        features[0] = 12.0;
        features[7] = 0.0;
        let ctx = context(UserProfile::default(), features);
        let out = BehavioralDetector.evaluate(&ctx).unwrap();
        assert_eq!(out.score, 0.6);
    }

    #[test]
    fn test_warm_z_score_flagging() {
        // mean 2, variance 1; observation 10 gives z = 8.
        let mut features = [0.0; FEATURE_DIM];
        features[0] = 10.0;
        let ctx = context(warm_profile(2.0, 1.0), features);
        let out = BehavioralDetector.evaluate(&ctx).unwrap();

        let deviation = out
            .anomalies
            .iter()
            .find(|a| a.feature.as_deref() == Some("events_per_hour"))
            .expect("deviation flagged");
        assert!((deviation.z_score.unwrap() - 8.0).abs() < 1e-9);
        // severity = clip((8-3)/5) = 1.0
        assert_eq!(deviation.severity, 1.0);
        assert_eq!(out.score, 1.0);
        assert_eq!(out.explanation["mode"], "warm");
    }

    #[test]
    fn test_warm_within_baseline_scores_zero() {
        let mut features = [0.0; FEATURE_DIM];
        features[0] = 2.5;
        let ctx = context(warm_profile(2.0, 1.0), features);
        let out = BehavioralDetector.evaluate(&ctx).unwrap();
        assert_eq!(out.score, 0.0);
    }

    #[test]
    fn test_warm_severity_scaling() {
        // z = 5.5 -> severity (5.5-3)/5 = 0.5
        let mut features = [0.0; FEATURE_DIM];
        features[0] = 7.5;
        let ctx = context(warm_profile(2.0, 1.0), features);
        let out = BehavioralDetector.evaluate(&ctx).unwrap();
        assert!((out.score - 0.5).abs() < 1e-9);
    }
}
