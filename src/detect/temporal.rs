//! Temporal detector.
//!
//! Looks for suprathreshold rates, coordinated multi-actor activity, and
//! unusual timing distributions. Fires as patterns; the component score is
//! the maximum emitted severity.

use crate::algo::{chisq, clip};
use crate::detect::features::burst_rate;
use crate::detect::{
    Detector, DetectorAnomaly, DetectorContext, DetectorKind, DetectorOutput, PatternKind,
    TemporalPattern,
};
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

/// Minimum mass in the 7-day hour histogram before the timing test runs
/// (two expected events per bin).
const TIMING_TEST_MIN_EVENTS: f64 = 48.0;
/// Severity assigned to a confirmed velocity acceleration.
const VELOCITY_SEVERITY: f64 = 0.6;

pub struct TemporalDetector;

impl Detector for TemporalDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Temporal
    }

    fn evaluate(&self, ctx: &DetectorContext) -> Result<DetectorOutput> {
        let mut out = DetectorOutput::empty(DetectorKind::Temporal);
        let now = ctx.event.created_at;
        let repo_name = ctx.event.repo.name.clone();

        let actor_times: Vec<DateTime<Utc>> =
            ctx.history.actor_events.iter().map(|o| o.ts).collect();
        let pair_times: Vec<DateTime<Utc>> = ctx
            .history
            .actor_events
            .iter()
            .filter(|o| o.repo_id == ctx.event.repo.id)
            .map(|o| o.ts)
            .collect();

        // Burst over the actor's events in the trailing window.
        let (burst_count, burst_rate_val, burst_severity) = burst_rate(
            &actor_times,
            now,
            ctx.params.burst_window_min,
            ctx.params.burst_min_count,
            ctx.params.burst_min_rate,
        );
        if burst_severity > 0.0 {
            out.patterns.push(TemporalPattern {
                kind: PatternKind::ActivityBurst,
                severity: burst_severity,
                repository: repo_name.clone(),
                window_start: now - Duration::minutes(ctx.params.burst_window_min),
                window_end: now,
                event_count: burst_count as u32,
                actor_count: 1,
            });
        }

        // Coordination across actors in the repo window.
        let coord_events = ctx.history.repo_recent.len();
        let coord_actors = ctx.history.distinct_repo_actors as usize;
        let coord_severity = if coord_actors >= ctx.params.coord_min_actors
            && coord_events >= ctx.params.coord_min_events
        {
            clip(coord_actors as f64 / 10.0, 0.0, 1.0)
        } else {
            0.0
        };
        if coord_severity > 0.0 {
            out.patterns.push(TemporalPattern {
                kind: PatternKind::CoordinatedActivity,
                severity: coord_severity,
                repository: repo_name.clone(),
                window_start: now - Duration::minutes(ctx.params.coord_window_min),
                window_end: now,
                event_count: coord_events as u32,
                actor_count: coord_actors as u32,
            });
        }

        // Hour-of-day distribution against uniform, over ~7 days.
        let mut timing_p = 1.0;
        if ctx.history.hour_histogram_total >= TIMING_TEST_MIN_EVENTS {
            let stat = chisq::uniform_statistic(&ctx.history.hour_histogram);
            timing_p = chisq::survival(stat, 23.0).max(1e-300);
            if timing_p < 0.01 {
                let severity = clip(-timing_p.log10() / 6.0, 0.0, 1.0);
                out.patterns.push(TemporalPattern {
                    kind: PatternKind::UnusualTiming,
                    severity,
                    repository: repo_name.clone(),
                    window_start: now - Duration::days(7),
                    window_end: now,
                    event_count: ctx.history.hour_histogram_total as u32,
                    actor_count: 1,
                });
            }
        }

        // Rate over the last five minutes against the five before that.
        let recent_rate = fixed_window_rate(&actor_times, now, 0, 5);
        let previous_rate = fixed_window_rate(&actor_times, now, 5, 10);
        let accelerating =
            recent_rate >= 3.0 * previous_rate && recent_rate >= 0.5 && previous_rate >= 0.5;
        if accelerating {
            out.patterns.push(TemporalPattern {
                kind: PatternKind::VelocityAcceleration,
                severity: VELOCITY_SEVERITY,
                repository: repo_name.clone(),
                window_start: now - Duration::minutes(10),
                window_end: now,
                event_count: actor_times.len() as u32,
                actor_count: 1,
            });
        }

        let (_, pair_rate, _) = burst_rate(
            &pair_times,
            now,
            ctx.params.burst_window_min,
            usize::MAX,
            f64::INFINITY,
        );
        let seven_day_rate_per_min = ctx.history.hour_histogram_total / (7.0 * 24.0 * 60.0);
        let baseline_ratio = if seven_day_rate_per_min > 0.0 {
            pair_rate / seven_day_rate_per_min
        } else {
            0.0
        };

        out.features = vec![
            pair_rate,
            baseline_ratio,
            burst_rate_val,
            gap_regularity(&actor_times, now),
            coord_severity,
            ctx.features[9],
            ctx.features[8],
            hour_concentration(&ctx.history.hour_histogram),
            if previous_rate > 0.0 { recent_rate / previous_rate } else { 0.0 },
        ];

        for pattern in &out.patterns {
            out.anomalies.push(DetectorAnomaly {
                kind: pattern_tag(pattern.kind).to_string(),
                feature: None,
                current: pattern.event_count as f64,
                z_score: None,
                severity: pattern.severity,
                location: Some(pattern.repository.clone()),
                detail: None,
            });
        }

        out.score = out.patterns.iter().map(|p| p.severity).fold(0.0, f64::max);
        out.explanation = json!({
            "patterns": out.patterns.iter().map(|p| pattern_tag(p.kind)).collect::<Vec<_>>(),
            "burst_rate_per_min": burst_rate_val,
            "coordinating_actors": coord_actors,
            "timing_p_value": timing_p,
            "recent_rate_per_min": recent_rate,
            "previous_rate_per_min": previous_rate,
        });
        Ok(out)
    }
}

fn pattern_tag(kind: PatternKind) -> &'static str {
    match kind {
        PatternKind::ActivityBurst => "activity_burst",
        PatternKind::CoordinatedActivity => "coordinated_activity",
        PatternKind::UnusualTiming => "unusual_timing",
        PatternKind::VelocityAcceleration => "velocity_acceleration",
    }
}

/// Events per minute in the fixed window `(now - end_min, now - start_min]`.
fn fixed_window_rate(
    times: &[DateTime<Utc>],
    now: DateTime<Utc>,
    start_min: i64,
    end_min: i64,
) -> f64 {
    let upper = now - Duration::minutes(start_min);
    let lower = now - Duration::minutes(end_min);
    let count = times.iter().filter(|ts| **ts > lower && **ts <= upper).count();
    count as f64 / (end_min - start_min) as f64
}

/// Coefficient of variation of inter-event gaps over the last hour; low
/// values mean machine-like regularity.
fn gap_regularity(times: &[DateTime<Utc>], now: DateTime<Utc>) -> f64 {
    let hour_ago = now - Duration::hours(1);
    let recent: Vec<DateTime<Utc>> =
        times.iter().copied().filter(|ts| *ts > hour_ago && *ts <= now).collect();
    if recent.len() < 3 {
        return 0.0;
    }
    let gaps: Vec<f64> = recent
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds().max(0) as f64 / 1_000.0)
        .collect();
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let var = gaps.iter().map(|g| (g - mean) * (g - mean)).sum::<f64>() / gaps.len() as f64;
    var.sqrt() / mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::detect::DetectorParams;
    use crate::event::{Actor, Event, EventType, Payload, Repo};
    use crate::history::{ActorObservation, HistorySnapshot};
    use crate::profile::{RepoProfile, UserProfile};

    fn base_time() -> DateTime<Utc> {
        "2026-07-01T12:00:00Z".parse().unwrap()
    }

    fn obs(ts: DateTime<Utc>, repo_id: u64) -> ActorObservation {
        ActorObservation {
            ts,
            kind: EventType::Push,
            repo_id,
            is_push: true,
            commit_count: 1,
            message_len_sum: 10,
            files_changed_sum: 0,
            files_known: false,
        }
    }

    fn context(history: HistorySnapshot) -> DetectorContext {
        DetectorContext {
            event: Event {
                id: "1".into(),
                kind: EventType::Push,
                actor: Actor { id: 9, login: "dev".into() },
                repo: Repo { id: 4, name: "o/r".into(), default_branch: None },
                created_at: base_time(),
                payload: Payload::Push(Default::default()),
            },
            user: UserProfile::default(),
            repo: RepoProfile::default(),
            history,
            features: [0.0; 10],
            params: DetectorParams::from_config(&Config::default()),
        }
    }

    fn snapshot(actor_events: Vec<ActorObservation>) -> HistorySnapshot {
        HistorySnapshot {
            actor_events,
            hour_histogram: [0.0; 24],
            hour_histogram_total: 0.0,
            repo_recent: Vec::new(),
            distinct_repo_actors: 0,
        }
    }

    #[test]
    fn test_quiet_actor_scores_zero() {
        let now = base_time();
        let events = vec![obs(now - Duration::minutes(30), 4), obs(now, 4)];
        let out = TemporalDetector.evaluate(&context(snapshot(events))).unwrap();
        assert_eq!(out.score, 0.0);
        assert!(out.patterns.is_empty());
    }

    #[test]
    fn test_burst_pattern_severity() {
        let now = base_time();
        // Twelve events across 90 seconds: rate 8/min, severity 0.75.
        let events: Vec<ActorObservation> = (0..12)
            .map(|i| obs(now - Duration::milliseconds(90_000 - i * 8_000), 4))
            .collect();
        let out = TemporalDetector.evaluate(&context(snapshot(events))).unwrap();

        let burst = out
            .patterns
            .iter()
            .find(|p| p.kind == PatternKind::ActivityBurst)
            .expect("burst fired");
        assert!((burst.severity - 0.75).abs() < 0.03);
        assert!((out.score - burst.severity).abs() < 1e-9);
    }

    #[test]
    fn test_coordination_pattern() {
        let now = base_time();
        let mut history = snapshot(vec![obs(now, 4)]);
        // Five actors, three events each, inside the window.
        let mut entries = Vec::new();
        for actor in 1..=5u64 {
            for i in 0..3 {
                entries.push((actor, now - Duration::minutes(8) + Duration::seconds(actor as i64 * 60 + i * 10)));
            }
        }
        history.repo_recent = entries;
        history.distinct_repo_actors = 5;

        let out = TemporalDetector.evaluate(&context(history)).unwrap();
        let coord = out
            .patterns
            .iter()
            .find(|p| p.kind == PatternKind::CoordinatedActivity)
            .expect("coordination fired");
        assert!((coord.severity - 0.5).abs() < 1e-9);
        assert_eq!(coord.actor_count, 5);
    }

    #[test]
    fn test_coordination_needs_both_thresholds() {
        let now = base_time();
        let mut history = snapshot(vec![obs(now, 4)]);
        // Five actors but only five events: below the event threshold.
        history.repo_recent = (1..=5u64).map(|a| (a, now - Duration::minutes(2))).collect();
        history.distinct_repo_actors = 5;

        let out = TemporalDetector.evaluate(&context(history)).unwrap();
        assert!(!out.patterns.iter().any(|p| p.kind == PatternKind::CoordinatedActivity));
    }

    #[test]
    fn test_unusual_timing_on_concentrated_hours() {
        let now = base_time();
        let mut history = snapshot(vec![obs(now, 4)]);
        // All weekly activity packed into two hours of the day.
        history.hour_histogram[3] = 40.0;
        history.hour_histogram[4] = 35.0;
        history.hour_histogram_total = 75.0;

        let out = TemporalDetector.evaluate(&context(history)).unwrap();
        let timing = out
            .patterns
            .iter()
            .find(|p| p.kind == PatternKind::UnusualTiming)
            .expect("timing fired");
        assert!(timing.severity > 0.3);
    }

    #[test]
    fn test_timing_needs_minimum_mass() {
        let now = base_time();
        let mut history = snapshot(vec![obs(now, 4)]);
        history.hour_histogram[3] = 10.0;
        history.hour_histogram_total = 10.0;
        let out = TemporalDetector.evaluate(&context(history)).unwrap();
        assert!(!out.patterns.iter().any(|p| p.kind == PatternKind::UnusualTiming));
    }

    #[test]
    fn test_velocity_acceleration() {
        let now = base_time();
        let mut events = Vec::new();
        // Previous window: 3 events in (t-10m, t-5m] -> 0.6/min.
        for i in 0..3 {
            events.push(obs(now - Duration::minutes(9) + Duration::minutes(i), 4));
        }
        // Recent window: 10 events in (t-5m, t] -> 2.0/min, > 3x previous.
        for i in 0..10 {
            events.push(obs(now - Duration::seconds(280 - i * 28), 4));
        }
        let out = TemporalDetector.evaluate(&context(snapshot(events))).unwrap();
        let accel = out
            .patterns
            .iter()
            .find(|p| p.kind == PatternKind::VelocityAcceleration)
            .expect("acceleration fired");
        assert_eq!(accel.severity, 0.6);
    }
}
