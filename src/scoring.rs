//! Deterministic scoring over merged intelligence.
//!
//! The weights below are part of the public contract: downstream consumers
//! compare scores across releases, so changing any constant is a breaking
//! change.

use crate::models::{IntelPayload, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CVSS_POINTS: f64 = 40.0;
pub const EPSS_POINTS: f64 = 20.0;
pub const KEV_BONUS: f64 = 10.0;
pub const MALWARE_BONUS: f64 = 15.0;
pub const ACTIVE_THREAT_BONUS: f64 = 15.0;

pub const MALICIOUS_WEIGHT: f64 = 0.4;
pub const BENIGN_WEIGHT: f64 = -0.3;
pub const POINTS_PER_PROPAGATED_HOST: f64 = 5.0;
pub const LATERAL_PROPAGATION_CAP: f64 = 25.0;
pub const ELEVATED_RISK_BONUS: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => Severity::Critical,
            70..=89 => Severity::High,
            40..=69 => Severity::Medium,
            _ => Severity::Low,
        }
    }

    fn correlation_points(self) -> f64 {
        match self {
            Severity::Critical => 15.0,
            Severity::High => 10.0,
            Severity::Medium => 5.0,
            Severity::Low => 0.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

/// Inputs to the detection score. Absent values contribute nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DetectionInputs {
    /// CVSS base score, 0-10.
    pub cvss_score: Option<f64>,
    /// EPSS probability, 0-1.
    pub epss_probability: Option<f64>,
    pub known_exploited: bool,
    pub malware_associated: bool,
    pub active_threat: bool,
}

impl From<&IntelPayload> for DetectionInputs {
    fn from(intel: &IntelPayload) -> Self {
        Self {
            cvss_score: intel.cvss_score,
            epss_probability: intel.epss_probability,
            known_exploited: intel.known_exploited.unwrap_or(false),
            malware_associated: intel.malware_associated.unwrap_or(false),
            active_threat: intel.active_threat.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreComponent {
    pub name: String,
    pub points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub components: Vec<ScoreComponent>,
    /// Sum of component points before clamping.
    pub raw_total: f64,
}

impl ScoreBreakdown {
    pub fn points(&self, name: &str) -> Option<f64> {
        self.components
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.points)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionScore {
    pub score: u8,
    pub severity: Severity,
    pub breakdown: ScoreBreakdown,
}

fn finite_or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn flag_points(flag: bool, points: f64) -> f64 {
    if flag {
        points
    } else {
        0.0
    }
}

/// Clamps to [0, 100] and truncates toward zero.
fn clamp_score(total: f64) -> u8 {
    if total.is_nan() {
        return 0;
    }
    total.clamp(0.0, 100.0).trunc() as u8
}

pub fn detection_breakdown(inputs: &DetectionInputs) -> ScoreBreakdown {
    let components = vec![
        ScoreComponent {
            name: "cvss".to_string(),
            points: finite_or_zero(inputs.cvss_score) / 10.0 * CVSS_POINTS,
        },
        ScoreComponent {
            name: "epss".to_string(),
            points: finite_or_zero(inputs.epss_probability) * EPSS_POINTS,
        },
        ScoreComponent {
            name: "kev".to_string(),
            points: flag_points(inputs.known_exploited, KEV_BONUS),
        },
        ScoreComponent {
            name: "threat_intel".to_string(),
            points: flag_points(inputs.malware_associated, MALWARE_BONUS)
                + flag_points(inputs.active_threat, ACTIVE_THREAT_BONUS),
        },
    ];
    let raw_total = components.iter().map(|c| c.points).sum();

    ScoreBreakdown {
        components,
        raw_total,
    }
}

pub fn detection_score(inputs: &DetectionInputs) -> u8 {
    clamp_score(detection_breakdown(inputs).raw_total)
}

/// Score, severity and breakdown in one pass.
pub fn score_detection(inputs: &DetectionInputs) -> DetectionScore {
    let breakdown = detection_breakdown(inputs);
    let score = clamp_score(breakdown.raw_total);

    DetectionScore {
        score,
        severity: Severity::from_score(score),
        breakdown,
    }
}

/// Inputs to the correlation confidence used by consumers that tie an
/// indicator to activity observed in the organisation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorrelationInputs {
    pub verdict: Option<Verdict>,
    /// 0-100.
    pub verdict_confidence: f64,
    pub propagated_hosts: u32,
    pub elevated_risk: bool,
    pub severity: Option<Severity>,
}

pub fn correlation_confidence(inputs: &CorrelationInputs) -> u8 {
    let confidence = finite_or_zero(Some(inputs.verdict_confidence));
    let verdict_points = match inputs.verdict {
        Some(Verdict::Malicious) => MALICIOUS_WEIGHT * confidence,
        Some(Verdict::Benign) => BENIGN_WEIGHT * confidence,
        _ => 0.0,
    };
    let lateral_points = (f64::from(inputs.propagated_hosts) * POINTS_PER_PROPAGATED_HOST)
        .min(LATERAL_PROPAGATION_CAP);
    let risk_points = flag_points(inputs.elevated_risk, ELEVATED_RISK_BONUS);
    let severity_points = inputs
        .severity
        .map(Severity::correlation_points)
        .unwrap_or(0.0);

    clamp_score(verdict_points + lateral_points + risk_points + severity_points)
}
