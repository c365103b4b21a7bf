/// Batch enrichment across independent intelligence sources.
///
/// For one request the orchestrator:
/// 1. Normalises and deduplicates ids, truncating to the batch cap
/// 2. Serves (id, source) pairs from the cache unless a refresh is forced
/// 3. Fans the remaining pairs out concurrently, each call gated by the
///    source's circuit breaker and a shared concurrency limit
/// 4. Waits for every call of the batch to settle (or hit the deadline)
/// 5. Merges payloads per id in source-priority order and scores the result
///
/// Upstream failures never abort the batch; they are returned alongside the
/// records.
use crate::cache::TtlCache;
use crate::circuit_breaker::{BreakerError, BreakerRegistry};
use crate::errors::AppError;
use crate::models::{
    normalize_entity_id, BatchTruncated, EnrichedRecord, EnrichmentReport, EnrichmentRequest,
    EntityKind, FailureKind, IntelPayload, SourceFailure, SourceResult,
};
use crate::scoring::{score_detection, DetectionInputs};
use crate::sources::{FetchResponse, SharedSource};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Unique ids kept per request; the rest are dropped.
    pub max_batch_size: usize,
    /// Upstream calls in flight across all concurrent batches.
    pub max_concurrency: usize,
    /// Deadline for one batch, measured from the start of `enrich`.
    pub batch_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_concurrency: 16,
            batch_timeout: Duration::from_secs(10),
        }
    }
}

/// Deduplicates (first occurrence wins), drops blanks and truncates to `cap`.
pub fn prepare_ids(raw: &[String], cap: usize) -> (Vec<String>, Option<BatchTruncated>) {
    let mut seen = HashSet::new();
    let unique: Vec<String> = raw
        .iter()
        .filter_map(|id| normalize_entity_id(id))
        .filter(|id| seen.insert(id.clone()))
        .collect();

    let requested = unique.len();
    if requested <= cap {
        return (unique, None);
    }

    let retained: Vec<String> = unique.into_iter().take(cap).collect();
    let truncated = BatchTruncated {
        requested,
        retained: retained.len(),
        dropped: requested - retained.len(),
    };
    (retained, Some(truncated))
}

/// Why a chunk of ids produced no data.
#[derive(Debug)]
enum CallError {
    Unavailable,
    Timeout(String),
    Failed(String),
}

impl CallError {
    fn kind(&self) -> FailureKind {
        match self {
            CallError::Unavailable => FailureKind::SourceUnavailable,
            CallError::Timeout(_) => FailureKind::SourceTimeout,
            CallError::Failed(_) => FailureKind::SourceError,
        }
    }

    fn message(&self, source: &str) -> String {
        match self {
            CallError::Unavailable => format!("{} unavailable: circuit open", source),
            CallError::Timeout(msg) | CallError::Failed(msg) => msg.clone(),
        }
    }
}

/// One upstream call: a source and the ids (by batch index) it covers.
struct Chunk {
    source_idx: usize,
    id_indices: Vec<usize>,
}

pub struct EnrichmentOrchestrator {
    cache: Arc<TtlCache<IntelPayload>>,
    breakers: Arc<BreakerRegistry>,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
}

impl EnrichmentOrchestrator {
    pub fn new(
        cache: Arc<TtlCache<IntelPayload>>,
        breakers: Arc<BreakerRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            cache,
            breakers,
            config,
            permits,
        }
    }

    pub fn cache(&self) -> &Arc<TtlCache<IntelPayload>> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Enriches `ids` against `sources` (highest merge priority first).
    pub async fn enrich(
        &self,
        ids: &[String],
        sources: &[SharedSource],
        force_refresh: bool,
    ) -> Result<EnrichmentReport, AppError> {
        let request = EnrichmentRequest::new(ids.to_vec(), "adhoc", force_refresh);
        self.run(&request, sources).await
    }

    pub async fn run(
        &self,
        request: &EnrichmentRequest,
        sources: &[SharedSource],
    ) -> Result<EnrichmentReport, AppError> {
        let started = Instant::now();
        let deadline = started + self.config.batch_timeout;

        if sources.is_empty() {
            return Err(AppError::InvalidRequest(
                "At least one source is required".to_string(),
            ));
        }

        let (ids, truncated) = prepare_ids(&request.ids, self.config.max_batch_size);
        if ids.is_empty() {
            return Err(AppError::InvalidRequest(
                "At least one entity id is required".to_string(),
            ));
        }
        if let Some(ref t) = truncated {
            tracing::warn!(
                job_id = %request.job_id,
                "Batch truncated: {} unique ids requested, {} kept, {} dropped",
                t.requested,
                t.retained,
                t.dropped
            );
        }

        tracing::info!(
            job_id = %request.job_id,
            job_type = %request.job_type,
            "Enriching {} id(s) across {} source(s) (force_refresh: {})",
            ids.len(),
            sources.len(),
            request.force_refresh
        );

        let kinds: Vec<EntityKind> = ids.iter().map(|id| EntityKind::classify(id)).collect();
        let mut settled: Vec<Vec<Option<SourceResult>>> = vec![vec![None; sources.len()]; ids.len()];

        // Cache pass. Anything not served here is fetched.
        let mut pending: Vec<Vec<usize>> = vec![Vec::new(); sources.len()];
        for (source_idx, source) in sources.iter().enumerate() {
            for (id_idx, id) in ids.iter().enumerate() {
                if !source.supports(kinds[id_idx]) {
                    continue;
                }
                if !request.force_refresh {
                    if let Some(payload) = self.cache.get(id, source.name()).await {
                        settled[id_idx][source_idx] =
                            Some(SourceResult::ok(source.name(), payload, true));
                        continue;
                    }
                }
                pending[source_idx].push(id_idx);
            }
        }

        let chunks: Vec<Chunk> = pending
            .iter()
            .enumerate()
            .flat_map(|(source_idx, id_indices)| {
                let size = sources[source_idx].max_batch_size().max(1);
                id_indices.chunks(size).map(move |chunk| Chunk {
                    source_idx,
                    id_indices: chunk.to_vec(),
                })
            })
            .collect();

        tracing::debug!(
            job_id = %request.job_id,
            "Dispatching {} upstream call(s)",
            chunks.len()
        );

        // Fan-in barrier: nothing is merged until every call has settled.
        let outcomes = join_all(chunks.iter().map(|chunk| {
            let chunk_ids: Vec<String> = chunk.id_indices.iter().map(|&i| ids[i].clone()).collect();
            self.dispatch(&sources[chunk.source_idx], chunk_ids, deadline)
        }))
        .await;

        for (chunk, outcome) in chunks.iter().zip(outcomes) {
            let source = sources[chunk.source_idx].name();
            match outcome {
                Ok(mut response) => {
                    for &id_idx in &chunk.id_indices {
                        let id = &ids[id_idx];
                        settled[id_idx][chunk.source_idx] =
                            Some(match response.remove(id).flatten() {
                                Some(payload) => SourceResult::ok(source, payload, false),
                                None => SourceResult::failed(
                                    source,
                                    FailureKind::SourceError,
                                    format!("{} returned no result for {}", source, id),
                                ),
                            });
                    }
                }
                Err(err) => {
                    let message = err.message(source);
                    for &id_idx in &chunk.id_indices {
                        settled[id_idx][chunk.source_idx] =
                            Some(SourceResult::failed(source, err.kind(), message.clone()));
                    }
                }
            }
        }

        let mut records = Vec::with_capacity(ids.len());
        let mut failures = Vec::new();
        for (id_idx, id) in ids.iter().enumerate() {
            let (record, record_failures) = merge_record(id, kinds[id_idx], &settled[id_idx]);
            records.push(record);
            failures.extend(record_failures);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            job_id = %request.job_id,
            "Enrichment finished in {}ms: {} record(s), {} failure(s)",
            duration_ms,
            records.len(),
            failures.len()
        );

        Ok(EnrichmentReport {
            job_id: request.job_id,
            job_type: request.job_type.clone(),
            records,
            failures,
            truncated,
            duration_ms,
        })
    }

    /// Runs one upstream call under the concurrency limit, the source's
    /// breaker and the batch deadline, then caches what it returned.
    async fn dispatch(
        &self,
        source: &SharedSource,
        chunk_ids: Vec<String>,
        deadline: Instant,
    ) -> Result<FetchResponse, CallError> {
        let breaker = self.breakers.get_or_create(source.name());

        let call = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| CallError::Failed("concurrency limiter closed".to_string()))?;

            breaker
                .call(|| source.fetch(&chunk_ids))
                .await
                .map_err(|err| match err {
                    BreakerError::Rejected => CallError::Unavailable,
                    BreakerError::Inner(e) => match e.root() {
                        AppError::Timeout(_) => CallError::Timeout(e.to_string()),
                        _ => CallError::Failed(e.to_string()),
                    },
                })
        };

        let result = match tokio::time::timeout_at(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout(format!(
                "{} did not answer within the {:?} batch deadline",
                source.name(),
                self.config.batch_timeout
            ))),
        };

        match result {
            Ok(response) => {
                for (id, payload) in &response {
                    if let Some(payload) = payload {
                        self.cache
                            .set(id, source.name(), payload.clone(), Some(source.default_ttl()))
                            .await;
                    }
                }
                Ok(response)
            }
            Err(err) => {
                tracing::warn!(
                    source = %source.name(),
                    "Upstream call for {} id(s) failed: {}",
                    chunk_ids.len(),
                    err.message(source.name())
                );
                Err(err)
            }
        }
    }
}

/// Combines one id's settled results. `settled` is in source-priority order,
/// so the first source to supply a field wins it.
fn merge_record(
    entity_id: &str,
    kind: EntityKind,
    settled: &[Option<SourceResult>],
) -> (EnrichedRecord, Vec<SourceFailure>) {
    let mut intel = IntelPayload::default();
    let mut sources = Vec::new();
    let mut cached_sources = Vec::new();
    let mut failed_sources = Vec::new();
    let mut failures = Vec::new();

    for result in settled.iter().flatten() {
        match result.payload {
            Some(ref payload) if result.success => {
                intel.merge_missing_from(payload);
                sources.push(result.source.clone());
                if result.from_cache {
                    cached_sources.push(result.source.clone());
                }
            }
            _ => {
                failed_sources.push(result.source.clone());
                failures.push(SourceFailure {
                    entity_id: entity_id.to_string(),
                    source: result.source.clone(),
                    kind: result.failure.unwrap_or(FailureKind::SourceError),
                    message: result.error.clone().unwrap_or_default(),
                });
            }
        }
    }

    let scored = if sources.is_empty() {
        None
    } else {
        Some(score_detection(&DetectionInputs::from(&intel)))
    };

    let record = EnrichedRecord {
        entity_id: entity_id.to_string(),
        kind,
        intel,
        score: scored.as_ref().map(|s| s.score),
        severity: scored.as_ref().map(|s| s.severity),
        breakdown: scored.map(|s| s.breakdown),
        sources,
        cached_sources,
        failed_sources,
    };
    (record, failures)
}
