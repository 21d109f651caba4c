//! Quote source trait and structured fetch errors.
//!
//! The `QuoteSource` trait abstracts over where prices come from (the CoinGecko
//! client, the TTL cache wrapping it, test doubles) so the coordinator never
//! depends on a concrete transport.

use crate::domain::{AssetQuote, CoinId, InvalidRequest, QuoteRequest};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Quotes keyed by asset identifier. Assets the upstream omitted are absent.
pub type QuoteMap = BTreeMap<CoinId, AssetQuote>;

/// Why a single attempt failed in a way worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransientFetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("upstream server error: HTTP {status}")]
    Server { status: u16 },

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

/// Errors a quote source surfaces to its caller. All of them end the execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("gave up after {attempts} attempts: {last}")]
    BudgetExhausted {
        attempts: u32,
        last: TransientFetchError,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("upstream returned no data for requested assets: {}", .requested.join(","))]
    UnknownAssets { requested: Vec<CoinId> },

    #[error("request rejected: HTTP {status}")]
    Rejected { status: u16 },

    #[error("circuit breaker open, retry in {}s", .retry_in.as_secs())]
    CircuitOpen { retry_in: Duration },

    #[error(transparent)]
    InvalidRequest(#[from] InvalidRequest),
}

impl FetchError {
    /// True when the failure came from upstream availability rather than a
    /// contract problem; a scheduler may reasonably try again on its next tick.
    pub fn is_retry_exhaustion(&self) -> bool {
        matches!(
            self,
            FetchError::BudgetExhausted { .. } | FetchError::CircuitOpen { .. }
        )
    }
}

/// Source of current prices.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch current quotes for every asset in the request, in one batch.
    async fn fetch(&self, request: &QuoteRequest) -> Result<QuoteMap, FetchError>;
}
