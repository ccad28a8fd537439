//! Persisted anomaly records.
//!
//! One record per reported event, immutable once written, idempotent on
//! event id. An optional summarizer seam lets an enrichment stage attach a
//! human-readable digest before persistence; the default does nothing.

use crate::detect::DetectorOutput;
use crate::error::Result;
use crate::event::Event;
use crate::fuse::{FusedScore, Severity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Anomaly severity at or above which a detection is listed among the
/// high-risk indicators.
const HIGH_RISK_INDICATOR_FLOOR: f64 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub event_id: String,
    pub repository_name: String,
    pub user_login: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub behavioral_anomaly_score: f64,
    pub content_risk_score: f64,
    pub temporal_anomaly_score: f64,
    pub repository_criticality_score: f64,
    pub final_anomaly_score: f64,
    pub severity_level: Severity,
    /// Human-facing label: the detector whose weighted contribution
    /// dominated the fused score.
    pub primary_detection_method: String,
    pub behavioral_analysis: serde_json::Value,
    pub content_analysis: serde_json::Value,
    pub temporal_analysis: serde_json::Value,
    pub repository_context: serde_json::Value,
    pub high_risk_indicators: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_summary: Option<String>,
    pub detection_timestamp: DateTime<Utc>,
}

impl AnomalyRecord {
    /// Assemble a record from the fused result and the four detector
    /// outputs, in [behavioral, temporal, content, contextual] order.
    pub fn build(
        event: &Event,
        fused: &FusedScore,
        outputs: &[DetectorOutput; 4],
        detection_timestamp: DateTime<Utc>,
    ) -> Self {
        let [behavioral, temporal, content, contextual] = outputs;

        let mut high_risk: Vec<String> = Vec::new();
        for output in outputs {
            for anomaly in &output.anomalies {
                if anomaly.severity >= HIGH_RISK_INDICATOR_FLOOR {
                    high_risk.push(match &anomaly.feature {
                        Some(feature) => format!("{}:{}", anomaly.kind, feature),
                        None => anomaly.kind.clone(),
                    });
                }
            }
        }
        high_risk.sort();
        high_risk.dedup();

        Self {
            event_id: event.id.clone(),
            repository_name: event.repo.name.clone(),
            user_login: event.actor.login.clone(),
            event_type: event.kind.as_str().to_string(),
            timestamp: event.created_at,
            behavioral_anomaly_score: behavioral.score,
            content_risk_score: content.score,
            temporal_anomaly_score: temporal.score,
            repository_criticality_score: contextual.score,
            final_anomaly_score: fused.final_score,
            severity_level: fused.severity,
            primary_detection_method: fused.primary.name().to_string(),
            behavioral_analysis: detector_blob(behavioral),
            content_analysis: detector_blob(content),
            temporal_analysis: detector_blob(temporal),
            repository_context: detector_blob(contextual),
            high_risk_indicators: high_risk,
            ai_summary: None,
            detection_timestamp,
        }
    }

    /// Whether any detector degraded (error or timeout) while producing
    /// this record.
    pub fn degraded(outputs: &[DetectorOutput; 4]) -> bool {
        outputs.iter().any(|o| o.is_degraded())
    }
}

fn detector_blob(output: &DetectorOutput) -> serde_json::Value {
    let mut blob = serde_json::json!({
        "score": output.score,
        "features": output.features,
        "explanation": output.explanation,
        "anomalies": output.anomalies,
        "degraded": output.is_degraded(),
    });
    if !output.patterns.is_empty() {
        blob["patterns"] = serde_json::json!(output.patterns);
    }
    blob
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a record. Returns `false` when a record for the event id
    /// already exists; the store is never overwritten.
    async fn insert(&self, record: AnomalyRecord) -> Result<bool>;

    async fn get(&self, event_id: &str) -> Result<Option<AnomalyRecord>>;

    /// Persist the event itself, idempotent on id. Returns `false` when
    /// already present.
    async fn persist_event(&self, event: &Event) -> Result<bool>;

    async fn record_count(&self) -> usize;
}

/// In-memory store; the durable backend behind the same trait is an
/// external collaborator.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, AnomalyRecord>>,
    events: RwLock<HashSet<String>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: AnomalyRecord) -> Result<bool> {
        let mut records = self.records.write().unwrap();
        if records.contains_key(&record.event_id) {
            return Ok(false);
        }
        records.insert(record.event_id.clone(), record);
        Ok(true)
    }

    async fn get(&self, event_id: &str) -> Result<Option<AnomalyRecord>> {
        Ok(self.records.read().unwrap().get(event_id).cloned())
    }

    async fn persist_event(&self, event: &Event) -> Result<bool> {
        Ok(self.events.write().unwrap().insert(event.id.clone()))
    }

    async fn record_count(&self) -> usize {
        self.records.read().unwrap().len()
    }
}

/// Enrichment seam for an optional summarization stage.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a short digest for the record, or `None` to leave it bare.
    async fn summarize(&self, record: &AnomalyRecord) -> Option<String>;
}

pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    async fn summarize(&self, _record: &AnomalyRecord) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorAnomaly, DetectorKind};
    use crate::event::{Actor, EventType, Payload, Repo};
    use crate::fuse;

    fn event() -> Event {
        Event {
            id: "evt-1".into(),
            kind: EventType::Push,
            actor: Actor { id: 1, login: "octocat".into() },
            repo: Repo { id: 2, name: "octo/hello".into(), default_branch: None },
            created_at: Utc::now(),
            payload: Payload::Push(Default::default()),
        }
    }

    fn outputs() -> [DetectorOutput; 4] {
        let mut content = DetectorOutput::empty(DetectorKind::Content);
        content.score = 0.9;
        content.anomalies.push(DetectorAnomaly {
            kind: "secret_leak".into(),
            feature: Some("aws_access_key".into()),
            current: 1.0,
            z_score: None,
            severity: 0.9,
            location: Some("abc123".into()),
            detail: Some("AKIA... (20 chars)".into()),
        });
        [
            DetectorOutput::empty(DetectorKind::Behavioral),
            DetectorOutput::empty(DetectorKind::Temporal),
            content,
            DetectorOutput::empty(DetectorKind::Contextual),
        ]
    }

    #[test]
    fn test_build_maps_scores_to_stable_fields() {
        let outs = outputs();
        let fused = fuse::fuse(0.0, 0.0, 0.9, 0.0);
        let record = AnomalyRecord::build(&event(), &fused, &outs, Utc::now());

        assert_eq!(record.event_id, "evt-1");
        assert_eq!(record.content_risk_score, 0.9);
        assert_eq!(record.behavioral_anomaly_score, 0.0);
        assert_eq!(record.final_anomaly_score, fused.final_score);
        assert_eq!(record.high_risk_indicators, vec!["secret_leak:aws_access_key"]);
        assert!(record.ai_summary.is_none());
    }

    #[test]
    fn test_severity_serializes_uppercase() {
        let outs = outputs();
        let fused = fuse::fuse(0.0, 0.0, 0.9, 1.0);
        let record = AnomalyRecord::build(&event(), &fused, &outs, Utc::now());
        let v = serde_json::to_value(&record).unwrap();
        assert!(matches!(
            v["severity_level"].as_str().unwrap(),
            "MEDIUM" | "HIGH" | "CRITICAL"
        ));
    }

    #[tokio::test]
    async fn test_store_idempotent_on_event_id() {
        let store = MemoryRecordStore::new();
        let outs = outputs();
        let fused = fuse::fuse(0.0, 0.0, 0.9, 0.0);
        let record = AnomalyRecord::build(&event(), &fused, &outs, Utc::now());

        assert!(store.insert(record.clone()).await.unwrap());
        assert!(!store.insert(record).await.unwrap());
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn test_event_persistence_idempotent() {
        let store = MemoryRecordStore::new();
        let ev = event();
        assert!(store.persist_event(&ev).await.unwrap());
        assert!(!store.persist_event(&ev).await.unwrap());
    }
}
