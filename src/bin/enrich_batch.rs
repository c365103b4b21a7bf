//! Enriches a batch of ids from the command line and prints the report.
//!
//! Ids come from the arguments, or from stdin (one per line) when none are
//! given. `--force-refresh` is forwarded to the request as-is. Logs go to
//! stderr so stdout stays valid JSON.

use std::io::BufRead;
use std::sync::Arc;
use threat_intel_enrich::cache::TtlCache;
use threat_intel_enrich::circuit_breaker::BreakerRegistry;
use threat_intel_enrich::config::Config;
use threat_intel_enrich::enrichment::EnrichmentOrchestrator;
use threat_intel_enrich::models::EnrichmentRequest;
use threat_intel_enrich::sources::build_sources;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let mut force_refresh = false;
    let mut ids: Vec<String> = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "--force-refresh" {
            force_refresh = true;
        } else {
            ids.push(arg);
        }
    }

    if ids.is_empty() {
        for line in std::io::stdin().lock().lines() {
            ids.push(line?);
        }
    }

    let config = Config::from_env()?;
    let orchestrator = EnrichmentOrchestrator::new(
        Arc::new(TtlCache::new(
            config.cache_default_ttl,
            config.cache_max_capacity,
        )),
        Arc::new(BreakerRegistry::new(config.breaker_config())),
        config.orchestrator_config(),
    );
    let sources = build_sources(&config)?;

    let request = EnrichmentRequest::new(ids, "cli", force_refresh);
    let report = orchestrator.run(&request, &sources).await?;

    tracing::info!(
        "Enriched {} record(s), {} failure(s)",
        report.records.len(),
        report.failures.len()
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
