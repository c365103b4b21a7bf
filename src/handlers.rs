use crate::config::Config;
use crate::enrichment::EnrichmentOrchestrator;
use crate::errors::AppError;
use crate::models::{EnrichmentReport, EnrichmentRequest};
use crate::sources::{select_sources, SharedSource};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Orchestrator owning the shared cache and breaker registry.
    pub orchestrator: Arc<EnrichmentOrchestrator>,
    /// Every configured source, highest merge priority first.
    pub sources: Vec<SharedSource>,
}

/// Health check endpoint.
///
/// Reports batch limits, cache statistics and the state of every source
/// breaker.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let breakers = state.orchestrator.breakers().all_metrics();
    let degraded = breakers
        .iter()
        .any(|b| b.state != crate::circuit_breaker::BreakerState::Closed);

    (
        StatusCode::OK,
        Json(json!({
            "status": if degraded { "degraded" } else { "healthy" },
            "service": "threat-intel-enrich",
            "version": env!("CARGO_PKG_VERSION"),
            "sources": state.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "limits": {
                "max_batch_size": state.config.max_batch_size,
                "max_concurrency": state.config.max_concurrency,
                "batch_timeout_secs": state.config.batch_timeout.as_secs(),
            },
            "cache": state.orchestrator.cache().stats(),
            "breakers": breakers,
        })),
    )
}

fn default_job_type() -> String {
    "adhoc".to_string()
}

#[derive(Debug, Deserialize)]
pub struct EnrichBody {
    pub ids: Vec<String>,
    #[serde(default = "default_job_type")]
    pub job_type: String,
    #[serde(default)]
    pub force_refresh: bool,
    /// Restrict the batch to these sources. Priority order is unchanged.
    #[serde(default)]
    pub sources: Option<Vec<String>>,
}

/// POST /api/v1/enrich
///
/// Enriches a batch of CVE ids / indicators and returns records plus the
/// per-source failure report.
pub async fn enrich(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnrichBody>,
) -> Result<Json<EnrichmentReport>, AppError> {
    tracing::info!(
        "POST /enrich - {} id(s), job_type: {}, force_refresh: {}",
        body.ids.len(),
        body.job_type,
        body.force_refresh
    );

    let sources = match body.sources {
        Some(ref names) => select_sources(&state.sources, names)?,
        None => state.sources.clone(),
    };

    let request = EnrichmentRequest::new(body.ids, body.job_type, body.force_refresh);
    let report = state.orchestrator.run(&request, &sources).await?;

    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct InvalidateParams {
    pub source: Option<String>,
}

/// DELETE /api/v1/cache/:id
///
/// Drops cached results for one entity, optionally for a single source.
pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<InvalidateParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let entity_id = crate::models::normalize_entity_id(&id)
        .ok_or_else(|| AppError::InvalidRequest("Entity id cannot be empty".to_string()))?;

    let removed = state
        .orchestrator
        .cache()
        .invalidate(&entity_id, params.source.as_deref())
        .await;
    tracing::info!("DELETE /cache/{} - removed {} entries", entity_id, removed);

    Ok(Json(json!({
        "entity_id": entity_id,
        "removed": removed,
    })))
}

/// POST /api/v1/breakers/:source/reset
pub async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.orchestrator.breakers().reset(&source) {
        return Err(AppError::NotFound(format!(
            "No circuit breaker for source {}",
            source
        )));
    }

    Ok(Json(json!({
        "source": source,
        "state": "closed",
    })))
}
