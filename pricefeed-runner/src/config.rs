//! Pipeline configuration.
//!
//! Loaded from TOML with every field defaulted, then optionally overridden
//! from a small set of environment variables. The resulting value is passed
//! explicitly into the coordinator; nothing below this module reads the
//! environment.

use crate::logging::LoggingConfig;
use chrono_tz::Tz;
use pricefeed_core::data::coingecko::{DEFAULT_API_KEY_HEADER, DEFAULT_BASE_URL};
use pricefeed_core::data::{CoinGeckoConfig, RetryPolicy};
use pricefeed_core::domain::{InvalidRequest, QuoteRequest};
use pricefeed_core::Normalizer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_API_KEY: &str = "COINGECKO_API_KEY";
pub const ENV_DB_URL: &str = "PRICEFEED_DB_URL";
pub const ENV_TIMEZONE: &str = "PRICEFEED_TIMEZONE";

const REDACTED: &str = "<redacted>";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("invalid asset selection: {0}")]
    Assets(#[from] InvalidRequest),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Upstream API connection and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of each backoff delay added as random jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Upper bound on a server-supplied `Retry-After` hint.
    #[serde(default = "default_max_retry_after_secs")]
    pub max_retry_after_secs: u64,
    /// Response cache lifetime; 0 disables caching.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_api_key_header() -> String {
    DEFAULT_API_KEY_HEADER.to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.1
}

fn default_max_retry_after_secs() -> u64 {
    120
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_breaker_cooldown_secs() -> u64 {
    30 * 60
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_key_header: default_api_key_header(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_retry_after_secs: default_max_retry_after_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

impl ApiConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            max_retry_after: Duration::from_secs(self.max_retry_after_secs),
        }
    }

    pub fn client_config(&self) -> CoinGeckoConfig {
        CoinGeckoConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone().filter(|k| !k.trim().is_empty()),
            api_key_header: self.api_key_header.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            retry: self.retry_policy(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// Tracked assets and quote currencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetsConfig {
    #[serde(default = "default_coins")]
    pub coins: Vec<String>,
    #[serde(default = "default_currencies")]
    pub currencies: Vec<String>,
}

fn default_coins() -> Vec<String> {
    [
        "bitcoin",
        "ethereum",
        "solana",
        "cardano",
        "polkadot",
        "ripple",
        "dogecoin",
        "litecoin",
        "binancecoin",
        "avalanche",
        "terra-luna",
        "chainlink",
        "uniswap",
        "stellar",
        "vechain",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_currencies() -> Vec<String> {
    vec!["usd".to_string()]
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            coins: default_coins(),
            currencies: default_currencies(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite URL, e.g. `sqlite://data/crypto.db` or `sqlite::memory:`.
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_store_url() -> String {
    "sqlite://data/crypto.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// IANA zone every stored and displayed timestamp is expressed in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// How far a source instant may lie ahead of the local clock.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
}

fn default_timezone() -> String {
    "Africa/Nairobi".to_string()
}

fn default_clock_skew_secs() -> u64 {
    300
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            clock_skew_secs: default_clock_skew_secs(),
        }
    }
}

impl ReportingConfig {
    pub fn zone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_interval_secs() -> u64 {
    300
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Complete configuration for one pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub api: ApiConfig,
    pub assets: AssetsConfig,
    pub store: StoreConfig,
    pub reporting: ReportingConfig,
    pub schedule: ScheduleConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Apply `COINGECKO_API_KEY`, `PRICEFEED_DB_URL` and `PRICEFEED_TIMEZONE`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(ENV_API_KEY) {
            self.api.api_key = Some(key);
        }
        if let Some(url) = get(ENV_DB_URL) {
            self.store.url = url;
        }
        if let Some(tz) = get(ENV_TIMEZONE) {
            self.reporting.timezone = tz;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quote_request()?;
        self.reporting.zone()?;

        if self.api.max_attempts == 0 {
            return Err(ConfigError::Invalid("api.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.api.jitter) {
            return Err(ConfigError::Invalid(format!(
                "api.jitter must be within [0, 1], got {}",
                self.api.jitter
            )));
        }
        if self.api.timeout_secs == 0 {
            return Err(ConfigError::Invalid("api.timeout_secs must be at least 1".into()));
        }
        if self.schedule.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "schedule.interval_secs must be at least 1".into(),
            ));
        }
        if self.store.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "store.max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn quote_request(&self) -> Result<QuoteRequest, InvalidRequest> {
        QuoteRequest::new(
            self.assets.coins.iter().cloned(),
            self.assets.currencies.iter().cloned(),
        )
    }

    pub fn normalizer(&self) -> Result<Normalizer, ConfigError> {
        let skew = chrono::Duration::seconds(self.reporting.clock_skew_secs as i64);
        Ok(Normalizer::new(self.reporting.zone()?).with_clock_skew(skew))
    }

    /// Effective configuration as TOML with the API key masked.
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.api.api_key.is_some() {
            shown.api.api_key = Some(REDACTED.to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}
