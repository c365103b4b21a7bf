//! Threat Intelligence Enrichment Library
//!
//! Enriches CVE ids and indicators of compromise by querying several
//! independent upstream sources concurrently, isolating failing sources behind
//! circuit breakers, caching per-source results and producing a deterministic
//! composite score.
//!
//! # Modules
//!
//! - `api`: API definitions.
//! - `core`: Core enrichment logic.
//! - `integrations`: Upstream source integrations.
//! - `cache`: TTL cache keyed by (entity id, source).
//! - `circuit_breaker`: Per-source circuit breakers and their registry.
//! - `config`: Configuration management.
//! - `enrichment`: Batch orchestration (fan-out, fan-in, merge).
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `models`: Core data models.
//! - `scoring`: Detection score, severity and correlation confidence.
//! - `services`: Upstream clients (NVD, EPSS, KEV, threat feed).
//! - `sources`: Source adapter contract.

pub mod api;
pub mod core;
pub mod integrations;

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod enrichment;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod scoring;
pub mod services;
pub mod sources;
