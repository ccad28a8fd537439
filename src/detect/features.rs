//! Behavioral feature extraction.
//!
//! Computes the 10-dimensional feature vector for an actor at the current
//! event from the actor's activity window. Pure; the snapshot already
//! contains the current event.

use crate::algo::{clip, shannon_entropy};
use crate::history::ActorObservation;
use crate::profile::FeatureVec;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use std::collections::HashMap;

/// Minimum span, in minutes, used when turning a window's event count into
/// a rate. Guards against a cluster of same-second events exploding the
/// estimate.
const MIN_RATE_SPAN_MIN: f64 = 0.5;

/// Events-per-minute rate over a trailing window, plus the burst severity
/// when the count and rate thresholds are both met.
///
/// The rate divides by the observed span of the window's events (not the
/// nominal window length), so a tight cluster reads as the high rate it is.
pub fn burst_rate(
    times: &[DateTime<Utc>],
    now: DateTime<Utc>,
    window_min: i64,
    min_count: usize,
    min_rate: f64,
) -> (usize, f64, f64) {
    let cutoff = now - Duration::minutes(window_min);
    let in_window: Vec<DateTime<Utc>> =
        times.iter().copied().filter(|ts| *ts > cutoff && *ts <= now).collect();
    let count = in_window.len();
    if count == 0 {
        return (0, 0.0, 0.0);
    }

    let first = in_window.iter().min().copied().unwrap_or(now);
    let span_min = ((now - first).num_milliseconds().max(0) as f64 / 60_000.0)
        .clamp(MIN_RATE_SPAN_MIN, window_min as f64);
    let rate = count as f64 / span_min;

    let severity = if count >= min_count && rate >= min_rate {
        clip((rate - min_rate) / 8.0, 0.0, 1.0)
    } else {
        0.0
    };
    (count, rate, severity)
}

/// The feature vector for the actor at time `now`.
pub fn extract(
    events: &[ActorObservation],
    now: DateTime<Utc>,
    burst_window_min: i64,
    burst_min_count: usize,
    burst_min_rate: f64,
) -> FeatureVec {
    let hour_ago = now - Duration::hours(1);
    let last_hour: Vec<&ActorObservation> =
        events.iter().filter(|o| o.ts > hour_ago && o.ts <= now).collect();

    let mut features = [0.0; 10];

    let count = last_hour.len();
    features[0] = count as f64;

    if count > 0 {
        let mut repos: Vec<u64> = last_hour.iter().map(|o| o.repo_id).collect();
        repos.sort_unstable();
        repos.dedup();
        features[1] = repos.len() as f64 / count as f64;
    }

    if count >= 2 {
        let gaps: Vec<f64> = last_hour
            .windows(2)
            .map(|pair| (pair[1].ts - pair[0].ts).num_milliseconds().max(0) as f64 / 60_000.0)
            .collect();
        features[2] = gaps.iter().sum::<f64>() / gaps.len() as f64;
    }

    let (commits, msg_len): (u64, u64) = last_hour
        .iter()
        .filter(|o| o.is_push)
        .fold((0, 0), |(c, m), o| (c + o.commit_count as u64, m + o.message_len_sum));
    if commits > 0 {
        features[3] = msg_len as f64 / commits as f64;
    }

    let (known_commits, files): (u64, u64) = last_hour
        .iter()
        .filter(|o| o.is_push && o.files_known)
        .fold((0, 0), |(c, f), o| {
            (c + o.commit_count as u64, f + o.files_changed_sum as u64)
        });
    if known_commits > 0 {
        features[4] = files as f64 / known_commits as f64;
    }

    let times: Vec<DateTime<Utc>> = events.iter().map(|o| o.ts).collect();
    let (_, _, burst) = burst_rate(&times, now, burst_window_min, burst_min_count, burst_min_rate);
    features[5] = burst;

    if count >= 2 {
        let first = last_hour.first().unwrap().ts;
        let last = last_hour.last().unwrap().ts;
        features[6] = (last - first).num_milliseconds().max(0) as f64 / 3_600_000.0;
    }

    let mut type_counts: HashMap<&str, u64> = HashMap::new();
    for obs in &last_hour {
        *type_counts.entry(obs.kind.as_str()).or_insert(0) += 1;
    }
    let counts: Vec<u64> = type_counts.values().copied().collect();
    features[7] = shannon_entropy(&counts);

    let day_ago = now - Duration::hours(24);
    let last_day: Vec<&ActorObservation> =
        events.iter().filter(|o| o.ts > day_ago && o.ts <= now).collect();
    if !last_day.is_empty() {
        let weekend = last_day
            .iter()
            .filter(|o| matches!(o.ts.weekday(), Weekday::Sat | Weekday::Sun))
            .count();
        features[8] = weekend as f64 / last_day.len() as f64;

        let off_hours = last_day
            .iter()
            .filter(|o| {
                let h = o.ts.hour();
                !(9..18).contains(&h)
            })
            .count();
        features[9] = off_hours as f64 / last_day.len() as f64;
    }

    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn obs(secs_ago: i64, now: DateTime<Utc>) -> ActorObservation {
        ActorObservation {
            ts: now - Duration::seconds(secs_ago),
            kind: EventType::Push,
            repo_id: 1,
            is_push: true,
            commit_count: 1,
            message_len_sum: 20,
            files_changed_sum: 3,
            files_known: true,
        }
    }

    fn base_time() -> DateTime<Utc> {
        // A Wednesday at 12:00 UTC.
        "2026-07-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_empty_window_is_all_zero() {
        let f = extract(&[], base_time(), 5, 5, 2.0);
        assert_eq!(f, [0.0; 10]);
    }

    #[test]
    fn test_counts_and_diversity() {
        let now = base_time();
        let mut events: Vec<ActorObservation> =
            (0..6).map(|i| obs(60 * i, now)).collect();
        events.reverse(); // oldest first
        events[0].repo_id = 2;

        let f = extract(&events, now, 5, 5, 2.0);
        assert_eq!(f[0], 6.0);
        assert!((f[1] - 2.0 / 6.0).abs() < 1e-12);
        // 6 events, one per minute: average gap 1 minute.
        assert!((f[2] - 1.0).abs() < 1e-9);
        assert_eq!(f[3], 20.0);
        assert_eq!(f[4], 3.0);
        // Single event type: zero entropy.
        assert_eq!(f[7], 0.0);
    }

    #[test]
    fn test_burst_rate_matches_cluster_span() {
        let now = base_time();
        // Twelve events over 90 seconds: 12 / 1.5 = 8 events/min.
        let times: Vec<DateTime<Utc>> = (0..12)
            .map(|i| now - Duration::milliseconds(90_000 - i * 8_000))
            .collect();
        let (count, rate, severity) = burst_rate(&times, now, 5, 5, 2.0);
        assert_eq!(count, 12);
        assert!((rate - 8.0).abs() < 0.2, "rate {rate}");
        assert!((severity - 0.75).abs() < 0.03, "severity {severity}");
    }

    #[test]
    fn test_burst_requires_count_threshold() {
        let now = base_time();
        let times: Vec<DateTime<Utc>> =
            (0..4).map(|i| now - Duration::seconds(10 * i)).collect();
        let (_, _, severity) = burst_rate(&times, now, 5, 5, 2.0);
        assert_eq!(severity, 0.0);
    }

    #[test]
    fn test_off_hours_ratio() {
        // Events at 03:00 UTC: outside 09-18.
        let night: DateTime<Utc> = "2026-07-01T03:00:00Z".parse().unwrap();
        let events: Vec<ActorObservation> = (0..4).map(|i| obs(60 * i, night)).collect();
        let f = extract(&events, night, 5, 5, 2.0);
        assert_eq!(f[9], 1.0);
        // Wednesday: no weekend activity.
        assert_eq!(f[8], 0.0);
    }

    #[test]
    fn test_weekend_ratio() {
        let saturday: DateTime<Utc> = "2026-07-04T12:00:00Z".parse().unwrap();
        let events: Vec<ActorObservation> = (0..3).map(|i| obs(60 * i, saturday)).collect();
        let f = extract(&events, saturday, 5, 5, 2.0);
        assert_eq!(f[8], 1.0);
    }
}
