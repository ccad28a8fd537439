//! Short-term activity windows.
//!
//! Detectors are pure functions over a snapshot of recent activity; this
//! store owns the sliding windows the snapshots are cut from. Per-actor
//! windows feed behavioral feature extraction and burst analysis, per-repo
//! windows feed coordination analysis. Both are bounded.

use crate::event::{Event, EventType, Payload};
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Hours of per-actor raw history kept for feature extraction.
const ACTOR_WINDOW_HOURS: i64 = 24;
/// Hard cap on raw events per actor window.
const ACTOR_WINDOW_CAP: usize = 4_096;
/// Hard cap on entries per repo window.
const REPO_WINDOW_CAP: usize = 4_096;
/// Half-life of the 7-day hour-of-day histogram, in hours.
const HOUR_HISTOGRAM_HALF_LIFE_HOURS: f64 = 84.0;

/// Compact per-event record kept in an actor's window.
#[derive(Debug, Clone)]
pub struct ActorObservation {
    pub ts: DateTime<Utc>,
    pub kind: EventType,
    pub repo_id: u64,
    pub is_push: bool,
    pub commit_count: u32,
    pub message_len_sum: u64,
    pub files_changed_sum: u32,
    pub files_known: bool,
}

impl ActorObservation {
    pub fn from_event(event: &Event) -> Self {
        let (is_push, commit_count, message_len_sum, files_changed_sum, files_known) =
            match &event.payload {
                Payload::Push(p) => {
                    let commits = p.commits.len() as u32;
                    let msg_len: u64 = p.commits.iter().map(|c| c.message.len() as u64).sum();
                    let files: u32 = p.commits.iter().map(|c| c.files.len() as u32).sum();
                    let known = p.commits.iter().any(|c| !c.files.is_empty());
                    (true, commits, msg_len, files, known)
                }
                _ => (false, 0, 0, 0, false),
            };
        Self {
            ts: event.created_at,
            kind: event.kind.clone(),
            repo_id: event.repo.id,
            is_push,
            commit_count,
            message_len_sum,
            files_changed_sum,
            files_known,
        }
    }
}

#[derive(Debug)]
struct ActorWindow {
    events: VecDeque<ActorObservation>,
    /// Hour-of-day histogram over roughly the last week, exponentially
    /// faded so it never needs a full rebuild.
    hour_histogram: [f64; 24],
    histogram_decayed_at: DateTime<Utc>,
}

impl ActorWindow {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            hour_histogram: [0.0; 24],
            histogram_decayed_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    fn push(&mut self, obs: ActorObservation) {
        let now = obs.ts;

        if self.histogram_decayed_at != DateTime::<Utc>::UNIX_EPOCH {
            let dt_hours =
                (now - self.histogram_decayed_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
            if dt_hours > 0.0 {
                let factor = (0.5f64).powf(dt_hours / HOUR_HISTOGRAM_HALF_LIFE_HOURS);
                for bin in self.hour_histogram.iter_mut() {
                    *bin *= factor;
                }
            }
        }
        self.histogram_decayed_at = now;
        self.hour_histogram[now.hour() as usize] += 1.0;

        self.events.push_back(obs);

        let cutoff = now - Duration::hours(ACTOR_WINDOW_HOURS);
        while let Some(front) = self.events.front() {
            if front.ts < cutoff || self.events.len() > ACTOR_WINDOW_CAP {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn newest_ts(&self) -> DateTime<Utc> {
        self.events.back().map(|o| o.ts).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

#[derive(Debug)]
struct RepoWindow {
    entries: VecDeque<(u64, DateTime<Utc>)>,
}

impl RepoWindow {
    fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    fn push(&mut self, actor_id: u64, ts: DateTime<Utc>, window_min: i64) {
        self.entries.push_back((actor_id, ts));
        let cutoff = ts - Duration::minutes(window_min);
        while let Some(&(_, front_ts)) = self.entries.front() {
            if front_ts < cutoff || self.entries.len() > REPO_WINDOW_CAP {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn newest_ts(&self) -> DateTime<Utc> {
        self.entries.back().map(|e| e.1).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Snapshot handed to the detector task group. Owned data, no locks.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    /// The actor's events in the last 24 h, oldest first, current included.
    pub actor_events: Vec<ActorObservation>,
    /// Faded hour-of-day histogram (~7 days).
    pub hour_histogram: [f64; 24],
    pub hour_histogram_total: f64,
    /// `(actor_id, ts)` entries in the repo's coordination window, current
    /// event included.
    pub repo_recent: Vec<(u64, DateTime<Utc>)>,
    pub distinct_repo_actors: u32,
}

/// Sharded owner of all sliding windows.
pub struct HistoryStore {
    actor_shards: Vec<Mutex<HashMap<u64, ActorWindow>>>,
    repo_shards: Vec<Mutex<HashMap<u64, RepoWindow>>>,
    max_tracked: usize,
}

impl HistoryStore {
    pub fn new(shards: usize, max_tracked: usize) -> Self {
        let shards = shards.max(1);
        Self {
            actor_shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            repo_shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            max_tracked: max_tracked.max(shards),
        }
    }

    /// Record an event into both windows and return the detector snapshot.
    pub fn record(&self, event: &Event, coord_window_min: i64) -> HistorySnapshot {
        let obs = ActorObservation::from_event(event);

        let (actor_events, hour_histogram) = {
            let shard = &self.actor_shards[shard_of(event.actor.id, self.actor_shards.len())];
            let mut map = shard.lock().unwrap();
            evict_if_crowded(&mut *map, self.max_tracked / self.actor_shards.len(), |w| {
                w.newest_ts()
            });
            let window = map.entry(event.actor.id).or_insert_with(ActorWindow::new);
            window.push(obs);
            (
                window.events.iter().cloned().collect::<Vec<_>>(),
                window.hour_histogram,
            )
        };

        let repo_recent = {
            let shard = &self.repo_shards[shard_of(event.repo.id, self.repo_shards.len())];
            let mut map = shard.lock().unwrap();
            evict_if_crowded(&mut *map, self.max_tracked / self.repo_shards.len(), |w| {
                w.newest_ts()
            });
            let window = map.entry(event.repo.id).or_insert_with(RepoWindow::new);
            window.push(event.actor.id, event.created_at, coord_window_min);
            window.entries.iter().copied().collect::<Vec<_>>()
        };

        let mut actors: Vec<u64> = repo_recent.iter().map(|(a, _)| *a).collect();
        actors.sort_unstable();
        actors.dedup();

        HistorySnapshot {
            actor_events,
            hour_histogram,
            hour_histogram_total: hour_histogram.iter().sum(),
            distinct_repo_actors: actors.len() as u32,
            repo_recent,
        }
    }
}

fn shard_of(key: u64, shards: usize) -> usize {
    (key % shards as u64) as usize
}

/// Drop the stalest half of a shard when it outgrows its budget.
fn evict_if_crowded<W, F>(map: &mut HashMap<u64, W>, cap: usize, newest: F)
where
    F: Fn(&W) -> DateTime<Utc>,
{
    if map.len() <= cap.max(16) {
        return;
    }
    let mut stamped: Vec<(u64, DateTime<Utc>)> =
        map.iter().map(|(k, w)| (*k, newest(w))).collect();
    stamped.sort_by_key(|(_, ts)| *ts);
    for (key, _) in stamped.iter().take(map.len() / 2) {
        map.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Actor, Repo};

    fn event_at(actor_id: u64, repo_id: u64, secs: i64) -> Event {
        Event {
            id: format!("e-{actor_id}-{secs}"),
            kind: EventType::Push,
            actor: Actor { id: actor_id, login: format!("user{actor_id}") },
            repo: Repo {
                id: repo_id,
                name: format!("org/repo{repo_id}"),
                default_branch: None,
            },
            created_at: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs),
            payload: Payload::Push(Default::default()),
        }
    }

    #[test]
    fn test_snapshot_includes_current_event() {
        let store = HistoryStore::new(4, 1_000);
        let snap = store.record(&event_at(1, 10, 100), 10);
        assert_eq!(snap.actor_events.len(), 1);
        assert_eq!(snap.repo_recent.len(), 1);
        assert_eq!(snap.distinct_repo_actors, 1);
    }

    #[test]
    fn test_actor_window_prunes_old_events() {
        let store = HistoryStore::new(1, 1_000);
        store.record(&event_at(1, 10, 0), 10);
        let snap = store.record(&event_at(1, 10, 25 * 3600), 10);
        // First event is older than 24 h and must be gone.
        assert_eq!(snap.actor_events.len(), 1);
    }

    #[test]
    fn test_repo_window_counts_distinct_actors() {
        let store = HistoryStore::new(2, 1_000);
        for actor in 1..=5u64 {
            for i in 0..3 {
                store.record(&event_at(actor, 42, 60 * (actor as i64 * 3 + i)), 10);
            }
        }
        let snap = store.record(&event_at(6, 42, 16 * 60), 10);
        assert!(snap.distinct_repo_actors >= 3);
    }

    #[test]
    fn test_hour_histogram_accumulates() {
        let store = HistoryStore::new(1, 1_000);
        let mut snap = store.record(&event_at(1, 10, 0), 10);
        for i in 1..10 {
            snap = store.record(&event_at(1, 10, i * 30), 10);
        }
        // All events land at hour 0 of the epoch day.
        assert!(snap.hour_histogram[0] > 9.0);
        assert!(snap.hour_histogram_total > 9.0);
    }
}
