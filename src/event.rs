//! Upstream event model.
//!
//! Events arrive as open JSON maps; here they become tagged variants with a
//! fallback for unknown upstream types. Payload structs carry only the
//! fields the detectors consume; the remainder rides along as an opaque
//! value so records can re-serialize what was observed.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Closed enumeration of upstream event types, with a forward-compatible
/// fallback for types this build does not know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "PushEvent")]
    Push,
    #[serde(rename = "WorkflowRunEvent")]
    WorkflowRun,
    #[serde(rename = "DeleteEvent")]
    Delete,
    #[serde(rename = "MemberEvent")]
    Member,
    #[serde(rename = "PullRequestEvent")]
    PullRequest,
    #[serde(rename = "IssuesEvent")]
    Issues,
    #[serde(rename = "CreateEvent")]
    Create,
    #[serde(rename = "ReleaseEvent")]
    Release,
    #[serde(rename = "ForkEvent")]
    Fork,
    #[serde(rename = "WatchEvent")]
    Watch,
    #[serde(rename = "StarEvent")]
    Star,
    #[serde(untagged)]
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Push => "PushEvent",
            EventType::WorkflowRun => "WorkflowRunEvent",
            EventType::Delete => "DeleteEvent",
            EventType::Member => "MemberEvent",
            EventType::PullRequest => "PullRequestEvent",
            EventType::Issues => "IssuesEvent",
            EventType::Create => "CreateEvent",
            EventType::Release => "ReleaseEvent",
            EventType::Fork => "ForkEvent",
            EventType::Watch => "WatchEvent",
            EventType::Star => "StarEvent",
            EventType::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingestion priority. High is never dropped; low is sampled on ingest and
/// shed first under backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Classify an event type and apply low-priority sampling.
///
/// Returns `None` when a low-priority event falls outside the sampled
/// fraction. The sampling hash is a stable function of the event id so the
/// decision survives restarts and repeats identically on redelivery.
pub fn classify(kind: &EventType, event_id: &str, sample_low: f64) -> Option<Priority> {
    match kind {
        EventType::Push | EventType::WorkflowRun | EventType::Delete | EventType::Member => {
            Some(Priority::High)
        }
        EventType::PullRequest
        | EventType::Issues
        | EventType::Create
        | EventType::Release
        | EventType::Fork => Some(Priority::Medium),
        _ => {
            let keep_below = (sample_low * 100.0).round() as u64;
            if xxh3_64(event_id.as_bytes()) % 100 < keep_below {
                Some(Priority::Low)
            } else {
                None
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: u64,
    pub login: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: u64,
    /// Full name, `owner/name`.
    pub name: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

impl Repo {
    /// Ref of the default branch; `refs/heads/main` when upstream omits it.
    pub fn default_branch_ref(&self) -> String {
        format!(
            "refs/heads/{}",
            self.default_branch.as_deref().unwrap_or("main")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub change: FileChangeKind,
    #[serde(default)]
    pub binary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    #[serde(default)]
    pub message: String,
    /// File-level changes when the upstream page carries them; often empty
    /// on the public stream.
    #[serde(default)]
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub commits: Vec<CommitInfo>,
    #[serde(default)]
    pub distinct_size: u32,
}

impl PushPayload {
    pub fn removed_file_count(&self) -> usize {
        self.commits
            .iter()
            .flat_map(|c| c.files.iter())
            .filter(|f| f.change == FileChangeKind::Removed)
            .count()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeletePayload {
    #[serde(default)]
    pub ref_type: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRunPayload {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberPayload {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub member_login: String,
}

/// Typed view of the payload for the event types detectors inspect; every
/// other type keeps its raw value untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Push(PushPayload),
    Delete(DeletePayload),
    WorkflowRun(WorkflowRunPayload),
    Member(MemberPayload),
    Opaque(serde_json::Value),
}

impl Payload {
    pub fn as_push(&self) -> Option<&PushPayload> {
        match self {
            Payload::Push(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_delete(&self) -> Option<&DeletePayload> {
        match self {
            Payload::Delete(p) => Some(p),
            _ => None,
        }
    }
}

/// Immutable, validated event. Created on ingest, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventType,
    pub actor: Actor,
    pub repo: Repo,
    pub created_at: DateTime<Utc>,
    pub payload: Payload,
}

impl Event {
    /// Stable shard key for per-actor lanes and sampling decisions.
    pub fn actor_hash(&self) -> u64 {
        self.actor.id
    }
}

/// Raw upstream shape, mirrored from the page JSON before validation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: RawActor,
    pub repo: RawRepo,
    pub created_at: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawActor {
    pub id: u64,
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawRepo {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

impl TryFrom<RawEvent> for Event {
    type Error = Error;

    fn try_from(raw: RawEvent) -> Result<Event> {
        if raw.id.is_empty() {
            return Err(Error::CorruptEvent { reason: "missing id" });
        }
        if raw.actor.login.is_empty() {
            return Err(Error::CorruptEvent { reason: "missing actor login" });
        }
        if raw.repo.name.is_empty() {
            return Err(Error::CorruptEvent { reason: "missing repository name" });
        }

        let created_at = DateTime::parse_from_rfc3339(&raw.created_at)
            .map_err(|_| Error::CorruptEvent { reason: "malformed timestamp" })?
            .with_timezone(&Utc);

        let kind: EventType =
            serde_json::from_value(serde_json::Value::String(raw.kind.clone()))
                .unwrap_or(EventType::Other(raw.kind.clone()));

        let payload = match kind {
            EventType::Push => serde_json::from_value(raw.payload.clone())
                .map(Payload::Push)
                .unwrap_or(Payload::Opaque(raw.payload)),
            EventType::Delete => serde_json::from_value(raw.payload.clone())
                .map(Payload::Delete)
                .unwrap_or(Payload::Opaque(raw.payload)),
            EventType::WorkflowRun => serde_json::from_value(raw.payload.clone())
                .map(Payload::WorkflowRun)
                .unwrap_or(Payload::Opaque(raw.payload)),
            EventType::Member => serde_json::from_value(raw.payload.clone())
                .map(Payload::Member)
                .unwrap_or(Payload::Opaque(raw.payload)),
            _ => Payload::Opaque(raw.payload),
        };

        Ok(Event {
            id: raw.id,
            kind,
            actor: Actor { id: raw.actor.id, login: raw.actor.login },
            repo: Repo {
                id: raw.repo.id,
                name: raw.repo.name,
                default_branch: raw.repo.default_branch,
            },
            created_at,
            payload,
        })
    }
}

/// Queue wire format: `{id, type, actor, repository, timestamp, payload, priority}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub actor: Actor,
    pub repository: Repo,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    pub priority: Priority,
}

impl WireEvent {
    pub fn pack(event: &Event, priority: Priority) -> Self {
        Self {
            id: event.id.clone(),
            kind: event.kind.clone(),
            actor: event.actor.clone(),
            repository: event.repo.clone(),
            timestamp: event.created_at,
            payload: event.payload.clone(),
            priority,
        }
    }

    pub fn unpack(self) -> (Event, Priority) {
        (
            Event {
                id: self.id,
                kind: self.kind,
                actor: self.actor,
                repo: self.repository,
                created_at: self.timestamp,
                payload: self.payload,
            },
            self.priority,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: &str) -> RawEvent {
        RawEvent {
            id: "30000000001".to_string(),
            kind: kind.to_string(),
            actor: RawActor { id: 77, login: "octocat".to_string() },
            repo: RawRepo {
                id: 1296269,
                name: "octocat/hello-world".to_string(),
                default_branch: None,
            },
            created_at: "2026-07-01T12:30:00Z".to_string(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn test_known_type_roundtrip() {
        let ev: Event = raw("PushEvent").try_into().unwrap();
        assert_eq!(ev.kind, EventType::Push);
        assert_eq!(ev.kind.as_str(), "PushEvent");
    }

    #[test]
    fn test_unknown_type_falls_back() {
        let ev: Event = raw("GollumEvent").try_into().unwrap();
        assert_eq!(ev.kind, EventType::Other("GollumEvent".to_string()));
        assert!(matches!(ev.payload, Payload::Opaque(_)));
    }

    #[test]
    fn test_corrupt_events_rejected() {
        let mut r = raw("PushEvent");
        r.created_at = "yesterday-ish".to_string();
        assert!(matches!(
            Event::try_from(r),
            Err(Error::CorruptEvent { reason: "malformed timestamp" })
        ));

        let mut r = raw("PushEvent");
        r.id = String::new();
        assert!(Event::try_from(r).is_err());
    }

    #[test]
    fn test_priority_classes() {
        assert_eq!(
            classify(&EventType::Push, "1", 0.2),
            Some(Priority::High)
        );
        assert_eq!(
            classify(&EventType::Delete, "1", 0.2),
            Some(Priority::High)
        );
        assert_eq!(
            classify(&EventType::PullRequest, "1", 0.2),
            Some(Priority::Medium)
        );
        assert_eq!(
            classify(&EventType::Fork, "1", 0.2),
            Some(Priority::Medium)
        );
    }

    #[test]
    fn test_low_priority_sampling_is_deterministic() {
        let kind = EventType::Watch;
        let first: Vec<bool> = (0..200)
            .map(|i| classify(&kind, &format!("ev-{i}"), 0.2).is_some())
            .collect();
        let second: Vec<bool> = (0..200)
            .map(|i| classify(&kind, &format!("ev-{i}"), 0.2).is_some())
            .collect();
        assert_eq!(first, second);

        let kept = first.iter().filter(|k| **k).count();
        // 20% target with hash spread; loose band, deterministic seed.
        assert!(kept > 15 && kept < 75, "kept {kept} of 200");
    }

    #[test]
    fn test_sampling_disabled_keeps_nothing_at_zero() {
        assert_eq!(classify(&EventType::Watch, "abc", 0.0), None);
    }

    #[test]
    fn test_push_payload_extraction() {
        let mut r = raw("PushEvent");
        r.payload = serde_json::json!({
            "ref": "refs/heads/main",
            "forced": true,
            "distinct_size": 2,
            "commits": [
                {"sha": "aaa111", "message": "fix build", "files": [
                    {"path": "src/main.rs", "change": "modified"}
                ]}
            ]
        });
        let ev: Event = r.try_into().unwrap();
        let push = ev.payload.as_push().unwrap();
        assert!(push.forced);
        assert_eq!(push.commits.len(), 1);
        assert_eq!(push.commits[0].files.len(), 1);
    }

    #[test]
    fn test_wire_format_field_names() {
        let ev: Event = raw("PushEvent").try_into().unwrap();
        let wire = WireEvent::pack(&ev, Priority::High);
        let v = serde_json::to_value(&wire).unwrap();
        assert_eq!(v["type"], "PushEvent");
        assert_eq!(v["priority"], "high");
        assert!(v["repository"]["name"].is_string());
        let (back, prio) = serde_json::from_value::<WireEvent>(v).unwrap().unpack();
        assert_eq!(back.id, ev.id);
        assert_eq!(prio, Priority::High);
    }
}
