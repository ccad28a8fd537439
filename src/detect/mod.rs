//! Detector framework.
//!
//! Four detectors run concurrently per event as a task group with a shared
//! deadline. Each is a pure function over a pre-assembled context snapshot;
//! failures and timeouts degrade to a zero score with the reason recorded
//! in the explanation, never an error up the stack.

pub mod behavioral;
pub mod content;
pub mod contextual;
pub mod features;
pub mod temporal;

use crate::algo::clip;
use crate::config::Config;
use crate::error::Result;
use crate::event::Event;
use crate::history::HistorySnapshot;
use crate::profile::{FeatureVec, RepoProfile, UserProfile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const NUM_DETECTORS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Behavioral,
    Temporal,
    Content,
    Contextual,
}

impl DetectorKind {
    pub fn name(&self) -> &'static str {
        match self {
            DetectorKind::Behavioral => "behavioral",
            DetectorKind::Temporal => "temporal",
            DetectorKind::Content => "content",
            DetectorKind::Contextual => "contextual",
        }
    }
}

/// Tuning knobs the detectors read, copied out of the runtime config so
/// the context is self-contained.
#[derive(Debug, Clone)]
pub struct DetectorParams {
    pub warm_n: u64,
    pub mvn_n: u64,
    pub burst_window_min: i64,
    pub burst_min_count: usize,
    pub burst_min_rate: f64,
    pub coord_window_min: i64,
    pub coord_min_actors: usize,
    pub coord_min_events: usize,
    pub criticality_ttl_min: i64,
}

impl DetectorParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            warm_n: config.warm_n,
            mvn_n: config.mvn_n,
            burst_window_min: config.burst_window_min,
            burst_min_count: config.burst_min_count,
            burst_min_rate: config.burst_min_rate,
            coord_window_min: config.coord_window_min,
            coord_min_actors: config.coord_min_actors,
            coord_min_events: config.coord_min_events,
            criticality_ttl_min: config.criticality_ttl_min,
        }
    }
}

/// Everything a detector may look at for one event. Owned snapshot; the
/// detectors never touch shared state.
#[derive(Debug, Clone)]
pub struct DetectorContext {
    pub event: Event,
    pub user: UserProfile,
    pub repo: RepoProfile,
    pub history: HistorySnapshot,
    /// Behavioral feature vector, computed once per event.
    pub features: FeatureVec,
    pub params: DetectorParams,
}

/// A single flagged deviation inside a detector's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorAnomaly {
    /// Machine tag, e.g. `feature_deviation`, `secret_leak`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    pub current: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    pub severity: f64,
    /// Best-effort location: file path, commit sha, branch ref.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    ActivityBurst,
    CoordinatedActivity,
    UnusualTiming,
    VelocityAcceleration,
}

/// A timing pattern that may straddle multiple events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalPattern {
    pub kind: PatternKind,
    pub severity: f64,
    pub repository: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub event_count: u32,
    pub actor_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorOutput {
    pub kind: DetectorKind,
    /// Component score in [0, 1].
    pub score: f64,
    pub features: Vec<f64>,
    pub explanation: serde_json::Value,
    pub anomalies: Vec<DetectorAnomaly>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<TemporalPattern>,
    /// `timeout` or `error` when the detector did not finish cleanly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl DetectorOutput {
    pub fn empty(kind: DetectorKind) -> Self {
        Self {
            kind,
            score: 0.0,
            features: Vec::new(),
            explanation: serde_json::json!({}),
            anomalies: Vec::new(),
            patterns: Vec::new(),
            degraded: None,
        }
    }

    pub fn degraded(kind: DetectorKind, reason: &str) -> Self {
        Self {
            kind,
            score: 0.0,
            features: Vec::new(),
            explanation: serde_json::json!({ "degraded": true, "reason": reason }),
            anomalies: Vec::new(),
            patterns: Vec::new(),
            degraded: Some(reason.to_string()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

pub trait Detector: Send + Sync + 'static {
    fn kind(&self) -> DetectorKind;
    fn evaluate(&self, ctx: &DetectorContext) -> Result<DetectorOutput>;
}

async fn run_one<D: Detector>(
    detector: D,
    ctx: Arc<DetectorContext>,
    timeout: Duration,
) -> DetectorOutput {
    let kind = detector.kind();
    let handle = tokio::task::spawn_blocking(move || detector.evaluate(&ctx));
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(mut output))) => {
            output.score = clip(output.score, 0.0, 1.0);
            output
        }
        Ok(Ok(Err(e))) => {
            tracing::debug!(detector = kind.name(), error = %e, "detector failed");
            DetectorOutput::degraded(kind, "error")
        }
        Ok(Err(join_err)) => {
            tracing::warn!(detector = kind.name(), error = %join_err, "detector panicked");
            DetectorOutput::degraded(kind, "error")
        }
        Err(_) => DetectorOutput::degraded(kind, "timeout"),
    }
}

/// Run all four detectors concurrently against one context, each bounded
/// by `timeout`. Returns outputs in [behavioral, temporal, content,
/// contextual] order.
pub async fn run_all(
    ctx: Arc<DetectorContext>,
    timeout: Duration,
) -> [DetectorOutput; NUM_DETECTORS] {
    let (b, t, c, r) = tokio::join!(
        run_one(behavioral::BehavioralDetector, ctx.clone(), timeout),
        run_one(temporal::TemporalDetector, ctx.clone(), timeout),
        run_one(content::ContentDetector, ctx.clone(), timeout),
        run_one(contextual::ContextualDetector, ctx.clone(), timeout),
    );
    [b, t, c, r]
}
