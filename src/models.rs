use crate::scoring::{ScoreBreakdown, Severity};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

fn cve_regex() -> &'static Regex {
    static CVE: OnceLock<Regex> = OnceLock::new();
    CVE.get_or_init(|| Regex::new(r"(?i)^CVE-\d{4}-\d{4,}$").expect("CVE pattern is valid"))
}

/// What kind of security entity an identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Cve,
    /// Hash, IP, domain, URL or any other indicator of compromise.
    Indicator,
}

impl EntityKind {
    pub fn classify(entity_id: &str) -> Self {
        if cve_regex().is_match(entity_id) {
            EntityKind::Cve
        } else {
            EntityKind::Indicator
        }
    }
}

/// Trims an identifier and upper-cases CVE ids so `cve-2024-1` and
/// `CVE-2024-1` share cache entries. Returns `None` for blank input.
pub fn normalize_entity_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if cve_regex().is_match(trimmed) {
        Some(trimmed.to_uppercase())
    } else {
        Some(trimmed.to_string())
    }
}

/// Reputation verdict reported by a threat-intelligence source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Malicious,
    Suspicious,
    Benign,
    Unknown,
}

/// Intelligence one source knows about one entity.
///
/// Every field is optional: `None` means the source said nothing about it,
/// which is different from a reported zero or `false`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntelPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cvss_vector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epss_probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epss_percentile: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_exploited: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub malware_associated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_threat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// 0-100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(other);
    }
}

impl IntelPayload {
    /// Fills every field still absent in `self` from `other`. Fields `self`
    /// already has are kept, so merging in priority order makes the first
    /// source that supplied a field win.
    pub fn merge_missing_from(&mut self, other: &IntelPayload) {
        fill(&mut self.cvss_score, &other.cvss_score);
        fill(&mut self.cvss_vector, &other.cvss_vector);
        fill(&mut self.epss_probability, &other.epss_probability);
        fill(&mut self.epss_percentile, &other.epss_percentile);
        fill(&mut self.known_exploited, &other.known_exploited);
        fill(&mut self.malware_associated, &other.malware_associated);
        fill(&mut self.active_threat, &other.active_threat);
        fill(&mut self.verdict, &other.verdict);
        fill(&mut self.verdict_confidence, &other.verdict_confidence);
        fill(&mut self.description, &other.description);
        fill(&mut self.published, &other.published);
        fill(&mut self.vendor, &other.vendor);
        fill(&mut self.product, &other.product);
        if self.tags.is_empty() {
            self.tags.clone_from(&other.tags);
        }
    }
}

/// A batch of entities to enrich.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub job_id: Uuid,
    pub ids: Vec<String>,
    pub job_type: String,
    #[serde(default)]
    pub force_refresh: bool,
}

impl EnrichmentRequest {
    pub fn new(ids: Vec<String>, job_type: impl Into<String>, force_refresh: bool) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            ids,
            job_type: job_type.into(),
            force_refresh,
        }
    }
}

/// How one (entity, source) pair settled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceResult {
    pub source: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<IntelPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub from_cache: bool,
}

impl SourceResult {
    pub fn ok(source: &str, payload: IntelPayload, from_cache: bool) -> Self {
        Self {
            source: source.to_string(),
            success: true,
            payload: Some(payload),
            error: None,
            failure: None,
            from_cache,
        }
    }

    pub fn failed(source: &str, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            success: false,
            payload: None,
            error: Some(error.into()),
            failure: Some(kind),
            from_cache: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// Breaker open; no call attempted.
    SourceUnavailable,
    /// Batch deadline passed before the call settled.
    SourceTimeout,
    /// The adapter reported an error or returned nothing for the id.
    SourceError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub entity_id: String,
    pub source: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Informational: the request held more unique ids than the batch cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchTruncated {
    pub requested: usize,
    pub retained: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRecord {
    pub entity_id: String,
    pub kind: EntityKind,
    pub intel: IntelPayload,
    /// `None` when no source contributed data.
    pub score: Option<u8>,
    pub severity: Option<Severity>,
    pub breakdown: Option<ScoreBreakdown>,
    /// Sources that supplied data, in priority order.
    pub sources: Vec<String>,
    /// Subset of `sources` served from cache.
    pub cached_sources: Vec<String>,
    /// Sources that failed, timed out or were skipped by an open breaker.
    pub failed_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentReport {
    pub job_id: Uuid,
    pub job_type: String,
    pub records: Vec<EnrichedRecord>,
    pub failures: Vec<SourceFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<BatchTruncated>,
    pub duration_ms: u64,
}

impl EnrichmentReport {
    pub fn failures_for(&self, source: &str) -> impl Iterator<Item = &SourceFailure> {
        let source = source.to_string();
        self.failures.iter().filter(move |f| f.source == source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_entities() {
        assert_eq!(EntityKind::classify("CVE-2021-44228"), EntityKind::Cve);
        assert_eq!(EntityKind::classify("cve-2021-44228"), EntityKind::Cve);
        assert_eq!(EntityKind::classify("CVE-21-1"), EntityKind::Indicator);
        assert_eq!(EntityKind::classify("198.51.100.7"), EntityKind::Indicator);
    }

    #[test]
    fn test_normalize_entity_id() {
        assert_eq!(
            normalize_entity_id("  cve-2021-44228 "),
            Some("CVE-2021-44228".to_string())
        );
        assert_eq!(
            normalize_entity_id("Evil.Example.com"),
            Some("Evil.Example.com".to_string())
        );
        assert_eq!(normalize_entity_id("   "), None);
    }

    #[test]
    fn test_merge_keeps_existing_fields() {
        let mut merged = IntelPayload {
            cvss_score: Some(7.5),
            known_exploited: Some(false),
            ..Default::default()
        };
        let lower = IntelPayload {
            cvss_score: Some(9.8),
            known_exploited: Some(true),
            epss_probability: Some(0.4),
            tags: vec!["ransomware".to_string()],
            ..Default::default()
        };

        merged.merge_missing_from(&lower);

        assert_eq!(merged.cvss_score, Some(7.5));
        assert_eq!(merged.known_exploited, Some(false));
        assert_eq!(merged.epss_probability, Some(0.4));
        assert_eq!(merged.tags, vec!["ransomware".to_string()]);
    }

    #[test]
    fn test_payload_serialization_omits_absent_fields() {
        let payload = IntelPayload {
            epss_probability: Some(0.0),
            ..Default::default()
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, serde_json::json!({ "epss_probability": 0.0 }));
    }
}
