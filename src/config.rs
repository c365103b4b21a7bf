use crate::circuit_breaker::{BreakerConfig, RecoveryBackoff};
use crate::enrichment::OrchestratorConfig;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_NVD_BASE_URL: &str = "https://services.nvd.nist.gov";
pub const DEFAULT_EPSS_BASE_URL: &str = "https://api.first.org";
pub const DEFAULT_KEV_FEED_URL: &str =
    "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    pub batch_timeout: Duration,
    pub cache_default_ttl: Duration,
    pub cache_max_capacity: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout: Duration,
    /// When set, Open periods grow exponentially from the recovery timeout up
    /// to this ceiling.
    pub breaker_max_recovery: Option<Duration>,
    pub nvd_base_url: String,
    pub nvd_api_key: Option<String>,
    pub epss_base_url: String,
    pub kev_feed_url: String,
    pub threat_feed_base_url: Option<String>,
    /// Source names in merge-priority order.
    pub source_priority: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            max_batch_size: 100,
            max_concurrency: 16,
            batch_timeout: Duration::from_secs(10),
            cache_default_ttl: Duration::from_secs(3600),
            cache_max_capacity: 100_000,
            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(30),
            breaker_max_recovery: None,
            nvd_base_url: DEFAULT_NVD_BASE_URL.to_string(),
            nvd_api_key: None,
            epss_base_url: DEFAULT_EPSS_BASE_URL.to_string(),
            kev_feed_url: DEFAULT_KEV_FEED_URL.to_string(),
            threat_feed_base_url: None,
            source_priority: ["nvd", "kev", "epss", "threat_feed"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            port: env_parse("PORT", defaults.port)
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            max_batch_size: env_parse("ENRICH_MAX_BATCH_SIZE", defaults.max_batch_size)
                .and_then(|n| {
                    if n == 0 {
                        anyhow::bail!("ENRICH_MAX_BATCH_SIZE must be greater than zero");
                    }
                    Ok(n)
                })?,
            max_concurrency: env_parse("ENRICH_MAX_CONCURRENCY", defaults.max_concurrency)
                .and_then(|n| {
                    if n == 0 {
                        anyhow::bail!("ENRICH_MAX_CONCURRENCY must be greater than zero");
                    }
                    Ok(n)
                })?,
            batch_timeout: Duration::from_secs(env_parse(
                "ENRICH_BATCH_TIMEOUT_SECS",
                defaults.batch_timeout.as_secs(),
            )?),
            cache_default_ttl: Duration::from_secs(env_parse(
                "CACHE_DEFAULT_TTL_SECS",
                defaults.cache_default_ttl.as_secs(),
            )?),
            cache_max_capacity: env_parse("CACHE_MAX_CAPACITY", defaults.cache_max_capacity)?,
            breaker_failure_threshold: env_parse(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            )
            .and_then(|n| {
                if n == 0 {
                    anyhow::bail!("BREAKER_FAILURE_THRESHOLD must be greater than zero");
                }
                Ok(n)
            })?,
            breaker_recovery_timeout: Duration::from_secs(env_parse(
                "BREAKER_RECOVERY_TIMEOUT_SECS",
                defaults.breaker_recovery_timeout.as_secs(),
            )?),
            breaker_max_recovery: match non_empty_var("BREAKER_MAX_RECOVERY_SECS") {
                Some(raw) => Some(Duration::from_secs(raw.parse().map_err(|_| {
                    anyhow::anyhow!("BREAKER_MAX_RECOVERY_SECS must be a number of seconds")
                })?)),
                None => None,
            },
            nvd_base_url: env_url("NVD_BASE_URL", &defaults.nvd_base_url)?,
            nvd_api_key: non_empty_var("NVD_API_KEY"),
            epss_base_url: env_url("EPSS_BASE_URL", &defaults.epss_base_url)?,
            kev_feed_url: env_url("KEV_FEED_URL", &defaults.kev_feed_url)?,
            threat_feed_base_url: match non_empty_var("THREAT_FEED_BASE_URL") {
                Some(raw) => Some(validate_url("THREAT_FEED_BASE_URL", raw)?),
                None => None,
            },
            source_priority: non_empty_var("SOURCE_PRIORITY")
                .map(|raw| parse_priority(&raw))
                .unwrap_or(defaults.source_priority),
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Batch cap: {}, concurrency: {}, deadline: {:?}",
            config.max_batch_size,
            config.max_concurrency,
            config.batch_timeout
        );
        tracing::debug!(
            "Breaker threshold: {}, recovery: {:?}",
            config.breaker_failure_threshold,
            config.breaker_recovery_timeout
        );
        tracing::debug!("Source priority: {:?}", config.source_priority);
        if config.nvd_api_key.is_some() {
            tracing::info!("NVD API key configured");
        }

        Ok(config)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_batch_size: self.max_batch_size,
            max_concurrency: self.max_concurrency,
            batch_timeout: self.batch_timeout,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        let backoff = match self.breaker_max_recovery {
            // failsafe's exponential schedule works in whole seconds.
            Some(max)
                if max > self.breaker_recovery_timeout
                    && self.breaker_recovery_timeout.as_secs() > 0 =>
            {
                RecoveryBackoff::Exponential {
                    start: self.breaker_recovery_timeout,
                    max,
                }
            }
            _ => RecoveryBackoff::Constant(self.breaker_recovery_timeout),
        };

        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            backoff,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match non_empty_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

fn env_url(key: &str, default: &str) -> anyhow::Result<String> {
    match non_empty_var(key) {
        Some(raw) => validate_url(key, raw),
        None => Ok(default.to_string()),
    }
}

fn validate_url(key: &str, raw: String) -> anyhow::Result<String> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| anyhow::anyhow!("{} is not a valid URL: {}", key, e))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("{} must start with http:// or https://", key);
    }
    Ok(raw.trim().trim_end_matches('/').to_string())
}

/// Parses a comma separated source list, dropping blanks and repeats.
pub fn parse_priority(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in raw.split(',').map(|s| s.trim().to_lowercase()) {
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_priority_dedupes_and_trims() {
        assert_eq!(
            parse_priority(" NVD, epss,,nvd ,kev"),
            vec!["nvd".to_string(), "epss".to_string(), "kev".to_string()]
        );
    }

    #[test]
    fn test_validate_url_rejects_other_schemes() {
        assert!(validate_url("X", "ftp://example.com".to_string()).is_err());
        assert!(validate_url("X", "not a url".to_string()).is_err());
        assert_eq!(
            validate_url("X", "https://example.com/".to_string()).unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn test_breaker_config_uses_exponential_when_ceiling_set() {
        let config = Config {
            breaker_max_recovery: Some(Duration::from_secs(120)),
            ..Config::default()
        };
        assert!(matches!(
            config.breaker_config().backoff,
            RecoveryBackoff::Exponential { .. }
        ));

        let config = Config::default();
        assert!(matches!(
            config.breaker_config().backoff,
            RecoveryBackoff::Constant(d) if d == Duration::from_secs(30)
        ));
    }
}
