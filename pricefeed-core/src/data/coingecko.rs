//! CoinGecko quote client.
//!
//! Fetches current prices from the `/simple/price` endpoint in one batched
//! request. Handles rate limiting (`Retry-After`), retries with exponential
//! backoff, response parsing, and the circuit breaker.
//!
//! The API key is optional. Without one the public endpoint still answers, at
//! a much lower rate limit.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{FetchError, QuoteMap, QuoteSource, TransientFetchError};
use super::retry::RetryPolicy;
use crate::clock::{Clock, SystemClock};
use crate::domain::{AssetQuote, QuoteRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";
pub const DEFAULT_API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// Connection settings for the CoinGecko client.
#[derive(Debug, Clone)]
pub struct CoinGeckoConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_key_header: String,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CoinGeckoConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one HTTP attempt that did not produce quotes.
#[derive(Debug)]
enum AttemptError {
    Transient(TransientFetchError),
    Fatal(FetchError),
}

impl From<reqwest::Error> for AttemptError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AttemptError::Transient(TransientFetchError::Timeout)
        } else {
            AttemptError::Transient(TransientFetchError::Network(e.to_string()))
        }
    }
}

pub struct CoinGeckoClient {
    client: reqwest::Client,
    config: CoinGeckoConfig,
    circuit_breaker: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
}

impl CoinGeckoClient {
    pub fn new(
        config: CoinGeckoConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("pricefeed/", env!("CARGO_PKG_VERSION")))
            .build()?;

        if config.api_key.is_none() {
            tracing::warn!("no API key configured, using public mode (limited rates)");
        }

        Ok(Self {
            client,
            config,
            circuit_breaker,
            clock: Arc::new(SystemClock),
        })
    }

    /// Clock used to resolve HTTP-date `Retry-After` hints.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    fn price_url(&self) -> String {
        format!("{}/simple/price", self.config.base_url.trim_end_matches('/'))
    }

    /// Execute one HTTP request and classify the result.
    async fn attempt(&self, request: &QuoteRequest) -> Result<QuoteMap, AttemptError> {
        let mut builder = self.client.get(self.price_url()).query(&[
            ("ids", request.ids_param()),
            ("vs_currencies", request.currencies_param()),
            ("include_last_updated_at", "true".to_string()),
        ]);
        if let Some(key) = &self.config.api_key {
            builder = builder.header(self.config.api_key_header.as_str(), key);
        }

        let resp = builder.send().await?;
        let status = resp.status();

        if status == StatusCode::FORBIDDEN {
            // Banned or key revoked: stop hammering.
            self.circuit_breaker.trip();
            return Err(AttemptError::Fatal(FetchError::Rejected {
                status: status.as_u16(),
            }));
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Transient(TransientFetchError::RateLimited {
                retry_after: parse_retry_after(resp.headers(), self.clock.now()),
            }));
        }

        if status.is_server_error() {
            return Err(AttemptError::Transient(TransientFetchError::Server {
                status: status.as_u16(),
            }));
        }

        if !status.is_success() {
            return Err(AttemptError::Fatal(FetchError::Rejected {
                status: status.as_u16(),
            }));
        }

        let body = resp.text().await?;
        parse_price_response(request, &body).map_err(AttemptError::Fatal)
    }

    /// Retry loop around [`Self::attempt`]. Never exceeds the attempt budget.
    async fn fetch_with_retry(&self, request: &QuoteRequest) -> Result<QuoteMap, FetchError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(FetchError::CircuitOpen {
                retry_in: self.circuit_breaker.remaining_cooldown(),
            });
        }

        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            tracing::debug!(attempt, max_attempts, assets = request.coins().len(), "requesting prices");

            match self.attempt(request).await {
                Ok(quotes) => {
                    self.circuit_breaker.record_success();
                    tracing::info!(attempt, assets = quotes.len(), "price request succeeded");
                    return Ok(quotes);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Transient(e)) => {
                    if attempt < max_attempts {
                        let delay = match &e {
                            TransientFetchError::RateLimited {
                                retry_after: Some(hint),
                            } => policy.retry_after(*hint),
                            _ => policy.backoff(attempt),
                        };
                        tracing::warn!(
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "transient fetch failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        self.circuit_breaker.record_failure();
        Err(FetchError::BudgetExhausted {
            attempts: max_attempts,
            last: last_error
                .unwrap_or_else(|| TransientFetchError::Network("no attempt made".into())),
        })
    }
}

#[async_trait]
impl QuoteSource for CoinGeckoClient {
    fn name(&self) -> &str {
        "coingecko"
    }

    async fn fetch(&self, request: &QuoteRequest) -> Result<QuoteMap, FetchError> {
        self.fetch_with_retry(request).await
    }
}

/// Read a `Retry-After` header in either delta-seconds or HTTP-date form.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    Some(
        (at.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}

/// Parse a `/simple/price` body into quotes for the requested assets.
///
/// Assets missing from the body are left out; the normalizer reports them.
/// An empty body means none of the identifiers were recognized.
pub fn parse_price_response(request: &QuoteRequest, body: &str) -> Result<QuoteMap, FetchError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let entries = value.as_object().ok_or_else(|| {
        FetchError::MalformedResponse("expected a JSON object at top level".into())
    })?;

    let mut quotes = QuoteMap::new();

    for (coin, entry) in entries {
        if !request.coins().contains(coin) {
            tracing::debug!(coin = %coin, "ignoring unrequested asset in response");
            continue;
        }

        let fields = entry.as_object().ok_or_else(|| {
            FetchError::MalformedResponse(format!("entry for '{coin}' is not an object"))
        })?;

        let last_updated_at = match fields.get("last_updated_at") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_i64().filter(|ts| *ts >= 0).ok_or_else(|| {
                FetchError::MalformedResponse(format!(
                    "invalid last_updated_at for '{coin}': {v}"
                ))
            })?),
        };

        let mut prices = BTreeMap::new();
        for currency in request.currencies() {
            match fields.get(currency) {
                None | Some(Value::Null) => continue,
                Some(v) => {
                    prices.insert(currency.clone(), parse_price(coin, currency, v)?);
                }
            }
        }

        quotes.insert(
            coin.clone(),
            AssetQuote {
                coin: coin.clone(),
                prices,
                last_updated_at,
            },
        );
    }

    if quotes.is_empty() {
        return Err(FetchError::UnknownAssets {
            requested: request.coins().iter().cloned().collect(),
        });
    }

    Ok(quotes)
}

fn parse_price(coin: &str, currency: &str, value: &Value) -> Result<Decimal, FetchError> {
    let malformed =
        || FetchError::MalformedResponse(format!("invalid {currency} price for '{coin}': {value}"));

    let Value::Number(number) = value else {
        return Err(malformed());
    };
    let text = number.to_string();
    let price = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| malformed())?;

    if price.is_sign_negative() && !price.is_zero() {
        return Err(malformed());
    }
    Ok(price.normalize())
}
