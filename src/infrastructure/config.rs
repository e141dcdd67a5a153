//! Application configuration.
//!
//! A closed set of environment knobs; everything has a default except the
//! upstream credentials, which are optional (a pre-seeded token cache works
//! without them).

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Serialize;

const ENV_PREFIX: &str = "MEDPRICE_";

/// Raised for malformed knob values. Maps to process exit code 2.
#[derive(Debug, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    /// sqlite database location, `sqlite:` URL or bare path.
    pub database_url: String,
    /// Upstream origin, no trailing slash.
    pub base_url: String,
    #[serde(skip_serializing)]
    pub phone: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub token_cache_path: PathBuf,
    /// Batch scheduler worker count.
    pub concurrency: usize,
    /// Concurrent browser contexts.
    pub browser_concurrency: usize,
    /// Endpoint-pass sufficiency threshold for the hybrid strategy.
    pub min_providers: usize,
    /// Upstream requests per second.
    pub rate_limit_rps: u32,
    pub listen_addr: SocketAddr,
    /// tracing env-filter directive, e.g. "medprice=debug,info".
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:medprice.db".to_string(),
            base_url: "https://dian.ysbang.cn".to_string(),
            phone: None,
            password: None,
            token_cache_path: PathBuf::from(".token_cache.json"),
            concurrency: 3,
            browser_concurrency: 2,
            min_providers: 5,
            rate_limit_rps: 5,
            listen_addr: "127.0.0.1:8850".parse().expect("static addr"),
            log_filter: "medprice=info,warn".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from the environment, falling back to defaults per knob.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            base_url: env_string("BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            phone: env_string("PHONE"),
            password: env_string("PASSWORD"),
            token_cache_path: env_string("TOKEN_CACHE")
                .map(PathBuf::from)
                .unwrap_or(defaults.token_cache_path),
            concurrency: env_parse("CONCURRENCY")?.unwrap_or(defaults.concurrency),
            browser_concurrency: env_parse("BROWSER_CONCURRENCY")?
                .unwrap_or(defaults.browser_concurrency),
            min_providers: env_parse("MIN_PROVIDERS")?.unwrap_or(defaults.min_providers),
            rate_limit_rps: env_parse("RATE_LIMIT_RPS")?.unwrap_or(defaults.rate_limit_rps),
            listen_addr: env_parse("LISTEN_ADDR")?.unwrap_or(defaults.listen_addr),
            log_filter: env_string("LOG").unwrap_or(defaults.log_filter),
        })
        .and_then(Self::validated)
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError("CONCURRENCY must be at least 1".into()));
        }
        if self.browser_concurrency == 0 {
            return Err(ConfigError("BROWSER_CONCURRENCY must be at least 1".into()));
        }
        if self.rate_limit_rps == 0 {
            return Err(ConfigError("RATE_LIMIT_RPS must be at least 1".into()));
        }
        if self.phone.is_some() != self.password.is_some() {
            return Err(ConfigError(
                "PHONE and PASSWORD must be set together".into(),
            ));
        }
        Ok(self)
    }

    pub fn has_credentials(&self) -> bool {
        self.phone.is_some() && self.password.is_some()
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError(format!("{ENV_PREFIX}{key}={raw}: {e}"))),
    }
}
