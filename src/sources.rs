//! Contract between the orchestrator and upstream intelligence sources.

use crate::config::Config;
use crate::errors::AppError;
use crate::models::{EntityKind, IntelPayload};
use crate::services::{EpssSource, KevSource, NvdSource, ThreatFeedSource};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-id answer from a source. A missing key or `None` means the source had
/// nothing usable for that id.
pub type FetchResponse = HashMap<String, Option<IntelPayload>>;

pub type SharedSource = Arc<dyn SourceAdapter>;

/// One upstream intelligence source.
///
/// Implementations must not panic for rate limiting, timeouts or malformed
/// responses. Per-id problems are reported as absent entries; an `Err` from
/// [`SourceAdapter::fetch`] means every id in that call failed.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable name used for cache keys, breaker names and reports.
    fn name(&self) -> &str;

    /// How long a successful result stays fresh in the cache.
    fn default_ttl(&self) -> Duration;

    /// Upper bound on ids per [`SourceAdapter::fetch`] call.
    fn max_batch_size(&self) -> usize {
        1
    }

    /// Whether the source has anything to say about this kind of entity.
    /// Unsupported pairs are never dispatched and are not failures.
    fn supports(&self, _kind: EntityKind) -> bool {
        true
    }

    async fn fetch(&self, ids: &[String]) -> Result<FetchResponse, AppError>;
}

/// Orders `sources` by the names in `priority`; sources not named keep their
/// relative order after the named ones.
pub fn order_by_priority(sources: Vec<SharedSource>, priority: &[String]) -> Vec<SharedSource> {
    let rank = |source: &SharedSource| {
        priority
            .iter()
            .position(|name| name == source.name())
            .unwrap_or(priority.len())
    };
    let mut ordered = sources;
    // Stable sort keeps ties in their original order.
    ordered.sort_by_key(|s| rank(s));
    ordered
}

/// Picks the named sources out of `available`, keeping `available`'s order.
pub fn select_sources(
    available: &[SharedSource],
    names: &[String],
) -> Result<Vec<SharedSource>, AppError> {
    if let Some(unknown) = names
        .iter()
        .find(|name| !available.iter().any(|s| s.name() == name.as_str()))
    {
        return Err(AppError::InvalidRequest(format!(
            "Unknown source: {}",
            unknown
        )));
    }

    Ok(available
        .iter()
        .filter(|s| names.iter().any(|n| n == s.name()))
        .cloned()
        .collect())
}

/// Builds every configured upstream client, ordered by `SOURCE_PRIORITY`.
pub fn build_sources(config: &Config) -> Result<Vec<SharedSource>, AppError> {
    let mut sources: Vec<SharedSource> = vec![
        Arc::new(NvdSource::new(
            config.nvd_base_url.clone(),
            config.nvd_api_key.clone(),
        )?),
        Arc::new(EpssSource::new(config.epss_base_url.clone())?),
        Arc::new(KevSource::new(config.kev_feed_url.clone())?),
    ];

    if let Some(ref base_url) = config.threat_feed_base_url {
        sources.push(Arc::new(ThreatFeedSource::new(base_url.clone())?));
    } else {
        tracing::info!("THREAT_FEED_BASE_URL not set, threat feed source disabled");
    }

    let ordered = order_by_priority(sources, &config.source_priority);
    tracing::info!(
        "Sources in priority order: {:?}",
        ordered.iter().map(|s| s.name()).collect::<Vec<_>>()
    );
    Ok(ordered)
}
