//! Score fusion.
//!
//! Combines the behavioral, temporal and content component scores into a
//! weighted base, amplifies it by the repository criticality multiplier,
//! and buckets the result into a severity level.

use crate::algo::clip;
use crate::detect::DetectorKind;
use serde::{Deserialize, Serialize};

pub const WEIGHT_BEHAVIORAL: f64 = 0.35;
pub const WEIGHT_TEMPORAL: f64 = 0.30;
pub const WEIGHT_CONTENT: f64 = 0.35;

/// Criticality amplification: `final = base * (1 + 0.5 * r)`.
pub const CRITICALITY_GAIN: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            Severity::Critical
        } else if score >= 0.65 {
            Severity::High
        } else if score >= 0.35 {
            Severity::Medium
        } else if score >= 0.15 {
            Severity::Low
        } else {
            Severity::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Lowercase tag used in channel names and metric labels.
    pub fn channel_tag(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FusedScore {
    pub base: f64,
    pub final_score: f64,
    pub severity: Severity,
    /// The detector whose weighted contribution dominates; ties resolve
    /// content over temporal over behavioral.
    pub primary: DetectorKind,
}

/// Fuse component scores. `b`, `t`, `c` are the behavioral, temporal and
/// content scores; `r` is the repository criticality. All in [0, 1].
pub fn fuse(b: f64, t: f64, c: f64, r: f64) -> FusedScore {
    let b = clip(b, 0.0, 1.0);
    let t = clip(t, 0.0, 1.0);
    let c = clip(c, 0.0, 1.0);
    let r = clip(r, 0.0, 1.0);

    let base = WEIGHT_BEHAVIORAL * b + WEIGHT_TEMPORAL * t + WEIGHT_CONTENT * c;
    let final_score = clip(base * (1.0 + CRITICALITY_GAIN * r), 0.0, 1.0);

    // Tie-break order is encoded by evaluation order with strict greater.
    let mut primary = DetectorKind::Content;
    let mut best = WEIGHT_CONTENT * c;
    if WEIGHT_TEMPORAL * t > best {
        primary = DetectorKind::Temporal;
        best = WEIGHT_TEMPORAL * t;
    }
    if WEIGHT_BEHAVIORAL * b > best {
        primary = DetectorKind::Behavioral;
    }

    FusedScore { base, final_score, severity: Severity::from_score(final_score), primary }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights() {
        let fused = fuse(1.0, 1.0, 1.0, 0.0);
        assert!((fused.base - 1.0).abs() < 1e-12);
        assert_eq!(fused.final_score, fused.base);
    }

    #[test]
    fn test_criticality_amplifies() {
        let flat = fuse(0.4, 0.2, 0.3, 0.0);
        let amplified = fuse(0.4, 0.2, 0.3, 0.8);
        assert_eq!(flat.final_score, flat.base);
        assert!(amplified.final_score > flat.final_score);
        assert!((amplified.final_score - flat.base * 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_final_clipped_at_one() {
        let fused = fuse(1.0, 1.0, 1.0, 1.0);
        assert_eq!(fused.final_score, 1.0);
        assert_eq!(fused.severity, Severity::Critical);
    }

    #[test]
    fn test_monotone_in_each_component() {
        let reference = fuse(0.3, 0.3, 0.3, 0.5);
        assert!(fuse(0.5, 0.3, 0.3, 0.5).final_score > reference.final_score);
        assert!(fuse(0.3, 0.5, 0.3, 0.5).final_score > reference.final_score);
        assert!(fuse(0.3, 0.3, 0.5, 0.5).final_score > reference.final_score);
    }

    #[test]
    fn test_force_push_scenario() {
        // Content 0.8 on a repo with criticality 0.5.
        let fused = fuse(0.0, 0.0, 0.8, 0.5);
        assert!((fused.base - 0.28).abs() < 1e-12);
        assert!(fused.final_score >= 0.35);
        assert!(fused.severity >= Severity::Medium);
        assert_eq!(fused.primary, DetectorKind::Content);
    }

    #[test]
    fn test_severity_buckets() {
        assert_eq!(Severity::from_score(0.0), Severity::Info);
        assert_eq!(Severity::from_score(0.149), Severity::Info);
        assert_eq!(Severity::from_score(0.15), Severity::Low);
        assert_eq!(Severity::from_score(0.35), Severity::Medium);
        assert_eq!(Severity::from_score(0.65), Severity::High);
        assert_eq!(Severity::from_score(0.85), Severity::Critical);
    }

    #[test]
    fn test_primary_tie_break_order() {
        // All zero: ties resolve to content.
        assert_eq!(fuse(0.0, 0.0, 0.0, 0.0).primary, DetectorKind::Content);
        // Equal weighted contributions for content and behavioral (0.35
        // each): content wins the tie.
        assert_eq!(fuse(1.0, 0.0, 1.0, 0.0).primary, DetectorKind::Content);
        // Temporal beats behavioral only when strictly larger.
        let fused = fuse(0.3, 0.9, 0.0, 0.0);
        assert_eq!(fused.primary, DetectorKind::Temporal);
        let fused = fuse(0.9, 0.3, 0.1, 0.0);
        assert_eq!(fused.primary, DetectorKind::Behavioral);
    }

    #[test]
    fn test_zero_criticality_identity() {
        for score in [0.1, 0.4, 0.9] {
            let fused = fuse(score, score, score, 0.0);
            assert_eq!(fused.final_score, fused.base);
        }
    }
}
