use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use threat_intel_enrich::cache::TtlCache;
use threat_intel_enrich::circuit_breaker::BreakerRegistry;
use threat_intel_enrich::config::Config;
use threat_intel_enrich::enrichment::EnrichmentOrchestrator;
use threat_intel_enrich::handlers::{self, AppState};
use threat_intel_enrich::sources::build_sources;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the application.
///
/// Builds the process-wide cache and breaker registry, the upstream clients
/// and the orchestrator, then serves the HTTP API.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threat_intel_enrich=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let cache = Arc::new(TtlCache::new(
        config.cache_default_ttl,
        config.cache_max_capacity,
    ));
    tracing::info!(
        "Intel cache initialized ({:?} default TTL, {} capacity)",
        config.cache_default_ttl,
        config.cache_max_capacity
    );

    let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
    let sources = build_sources(&config)?;
    for source in &sources {
        breakers.get_or_create(source.name());
    }

    let orchestrator = Arc::new(EnrichmentOrchestrator::new(
        cache,
        breakers,
        config.orchestrator_config(),
    ));

    let app_state = Arc::new(AppState {
        config: config.clone(),
        orchestrator,
        sources,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        .route("/api/v1/enrich", post(handlers::enrich))
        .route("/api/v1/cache/:id", delete(handlers::invalidate_cache))
        .route(
            "/api/v1/breakers/:source/reset",
            post(handlers::reset_breaker),
        )
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB max payload
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
