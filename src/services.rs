use crate::errors::{AppError, ResultExt};
use crate::models::{EntityKind, IntelPayload, Verdict};
use crate::sources::{FetchResponse, SourceAdapter};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

fn build_client(name: &str) -> Result<Client, AppError> {
    Client::builder()
        .timeout(CLIENT_TIMEOUT)
        .user_agent(concat!("threat-intel-enrich/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AppError::ExternalApiError(format!("Failed to create {} client: {}", name, e)))
}

/// Fails with the response body when the status is not 2xx.
async fn ensure_success(
    source: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, AppError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    tracing::error!("{} returned error {}: {}", source, status, error_text);
    Err(AppError::ExternalApiError(format!(
        "{} returned status {}: {}",
        source, status, error_text
    )))
}

/// CVSS data from the NVD CVE API 2.0.
pub struct NvdSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl NvdSource {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("NVD")?,
            base_url,
            api_key,
        })
    }

    async fn fetch_one(&self, cve_id: &str) -> Result<Option<IntelPayload>, AppError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/rest/json/cves/2.0", self.base_url),
            &[("cveId", cve_id)],
        )
        .map_err(|e| AppError::ExternalApiError(format!("Failed to build URL: {}", e)))?;

        tracing::info!("Fetching NVD record for {}", cve_id);

        let mut request = self.client.get(url);
        if let Some(ref key) = self.api_key {
            request = request.header("apiKey", key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("NVD request for {} failed", cve_id))?;
        let response = ensure_success("NVD", response).await?;

        let body: Value = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse NVD response: {}", e))
        })?;

        Ok(parse_nvd_response(&body))
    }
}

fn first_cvss_metric(metrics: &Value) -> Option<&Value> {
    ["cvssMetricV31", "cvssMetricV30", "cvssMetricV2"]
        .iter()
        .filter_map(|key| metrics.get(key).and_then(|m| m.as_array()))
        .find_map(|list| list.first())
}

/// Extracts the first vulnerability from an NVD 2.0 response body.
pub fn parse_nvd_response(body: &Value) -> Option<IntelPayload> {
    let cve = body
        .get("vulnerabilities")
        .and_then(|v| v.as_array())
        .and_then(|list| list.first())
        .and_then(|entry| entry.get("cve"))?;

    let cvss_data = cve
        .get("metrics")
        .and_then(first_cvss_metric)
        .and_then(|metric| metric.get("cvssData"));

    let description = cve
        .get("descriptions")
        .and_then(|d| d.as_array())
        .and_then(|list| {
            list.iter()
                .find(|d| d.get("lang").and_then(|l| l.as_str()) == Some("en"))
        })
        .and_then(|d| d.get("value"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Some(IntelPayload {
        cvss_score: cvss_data
            .and_then(|d| d.get("baseScore"))
            .and_then(|s| s.as_f64()),
        cvss_vector: cvss_data
            .and_then(|d| d.get("vectorString"))
            .and_then(|s| s.as_str())
            .map(|s| s.to_string()),
        description,
        published: cve
            .get("published")
            .and_then(|p| p.as_str())
            .map(|s| s.to_string()),
        ..Default::default()
    })
}

#[async_trait]
impl SourceAdapter for NvdSource {
    fn name(&self) -> &str {
        "nvd"
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_secs(24 * 3600)
    }

    fn supports(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Cve
    }

    async fn fetch(&self, ids: &[String]) -> Result<FetchResponse, AppError> {
        let mut results = FetchResponse::new();
        for id in ids {
            results.insert(id.clone(), self.fetch_one(id).await?);
        }
        Ok(results)
    }
}

#[derive(Debug, Deserialize)]
struct EpssResponse {
    #[serde(default)]
    data: Vec<EpssRow>,
}

#[derive(Debug, Deserialize)]
struct EpssRow {
    cve: String,
    epss: String,
    percentile: String,
}

/// Exploit prediction scores from the FIRST EPSS API.
pub struct EpssSource {
    client: Client,
    base_url: String,
}

impl EpssSource {
    pub fn new(base_url: String) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("EPSS")?,
            base_url,
        })
    }
}

#[async_trait]
impl SourceAdapter for EpssSource {
    fn name(&self) -> &str {
        "epss"
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_secs(24 * 3600)
    }

    fn max_batch_size(&self) -> usize {
        100
    }

    fn supports(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Cve
    }

    async fn fetch(&self, ids: &[String]) -> Result<FetchResponse, AppError> {
        let joined = ids.join(",");
        let url = reqwest::Url::parse_with_params(
            &format!("{}/data/v1/epss", self.base_url),
            &[("cve", joined.as_str())],
        )
        .map_err(|e| AppError::ExternalApiError(format!("Failed to build URL: {}", e)))?;

        tracing::info!("Fetching EPSS scores for {} CVE(s)", ids.len());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("EPSS request failed")?;
        let response = ensure_success("EPSS", response).await?;

        let body: EpssResponse = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse EPSS response: {}", e))
        })?;

        let mut by_cve: HashMap<String, IntelPayload> = HashMap::new();
        for row in body.data {
            let probability = row.epss.parse::<f64>().ok();
            if probability.is_none() {
                tracing::warn!("EPSS returned unparsable score for {}: {}", row.cve, row.epss);
                continue;
            }
            by_cve.insert(
                row.cve.to_uppercase(),
                IntelPayload {
                    epss_probability: probability,
                    epss_percentile: row.percentile.parse::<f64>().ok(),
                    ..Default::default()
                },
            );
        }

        Ok(ids
            .iter()
            .map(|id| (id.clone(), by_cve.remove(&id.to_uppercase())))
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct KevCatalog {
    #[serde(default)]
    vulnerabilities: Vec<KevEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KevEntry {
    #[serde(rename = "cveID")]
    cve_id: String,
    #[serde(default)]
    vendor_project: Option<String>,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    known_ransomware_campaign_use: Option<String>,
}

/// Known-exploited flag from the CISA KEV catalog.
///
/// The catalog is a single document, so one call answers any number of ids.
/// Ids not in the catalog get `known_exploited = false`, not an absent result.
pub struct KevSource {
    client: Client,
    feed_url: String,
}

impl KevSource {
    pub fn new(feed_url: String) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("KEV")?,
            feed_url,
        })
    }
}

#[async_trait]
impl SourceAdapter for KevSource {
    fn name(&self) -> &str {
        "kev"
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_secs(6 * 3600)
    }

    fn max_batch_size(&self) -> usize {
        1000
    }

    fn supports(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Cve
    }

    async fn fetch(&self, ids: &[String]) -> Result<FetchResponse, AppError> {
        tracing::info!("Fetching KEV catalog for {} CVE(s)", ids.len());

        let response = self
            .client
            .get(&self.feed_url)
            .send()
            .await
            .context("KEV catalog request failed")?;
        let response = ensure_success("KEV", response).await?;

        let catalog: KevCatalog = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse KEV catalog: {}", e))
        })?;

        let mut listed: HashMap<String, KevEntry> = catalog
            .vulnerabilities
            .into_iter()
            .map(|entry| (entry.cve_id.to_uppercase(), entry))
            .collect();

        Ok(ids
            .iter()
            .map(|id| {
                let payload = match listed.remove(&id.to_uppercase()) {
                    Some(entry) => {
                        let ransomware = entry
                            .known_ransomware_campaign_use
                            .as_deref()
                            .map(|v| v.eq_ignore_ascii_case("known"))
                            .unwrap_or(false);
                        IntelPayload {
                            known_exploited: Some(true),
                            vendor: entry.vendor_project,
                            product: entry.product,
                            tags: if ransomware {
                                vec!["ransomware".to_string()]
                            } else {
                                Vec::new()
                            },
                            ..Default::default()
                        }
                    }
                    None => IntelPayload {
                        known_exploited: Some(false),
                        ..Default::default()
                    },
                };
                (id.clone(), Some(payload))
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct ThreatFeedIndicator {
    #[serde(default)]
    malware_associated: Option<bool>,
    #[serde(default)]
    active_threat: Option<bool>,
    #[serde(default)]
    verdict: Option<Verdict>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Reputation and live-activity flags from a threat feed exposing
/// `GET /api/v1/indicators/{id}`.
pub struct ThreatFeedSource {
    client: Client,
    base_url: String,
}

impl ThreatFeedSource {
    pub fn new(base_url: String) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client("threat feed")?,
            base_url,
        })
    }

    async fn fetch_one(&self, id: &str) -> Result<Option<IntelPayload>, AppError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| AppError::ExternalApiError(format!("Failed to build URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| AppError::ExternalApiError("Threat feed URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["api", "v1", "indicators", id]);

        tracing::info!("Fetching threat feed indicator {}", id);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Threat feed request for {} failed", id))?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("Threat feed has no record for {}", id);
            return Ok(None);
        }
        let response = ensure_success("Threat feed", response).await?;

        let indicator: ThreatFeedIndicator = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse threat feed response: {}", e))
        })?;

        Ok(Some(IntelPayload {
            malware_associated: indicator.malware_associated,
            active_threat: indicator.active_threat,
            verdict: indicator.verdict,
            verdict_confidence: indicator.confidence,
            tags: indicator.tags,
            ..Default::default()
        }))
    }
}

#[async_trait]
impl SourceAdapter for ThreatFeedSource {
    fn name(&self) -> &str {
        "threat_feed"
    }

    fn default_ttl(&self) -> Duration {
        Duration::from_secs(3600)
    }

    async fn fetch(&self, ids: &[String]) -> Result<FetchResponse, AppError> {
        let mut results = FetchResponse::new();
        for id in ids {
            results.insert(id.clone(), self.fetch_one(id).await?);
        }
        Ok(results)
    }
}
