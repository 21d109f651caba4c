//! Quote acquisition: source trait, CoinGecko client, retry and caching

pub mod cache;
pub mod circuit_breaker;
pub mod coingecko;
pub mod provider;
pub mod retry;

pub use cache::CachedQuoteSource;
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use coingecko::{parse_price_response, CoinGeckoClient, CoinGeckoConfig};
pub use provider::{FetchError, QuoteMap, QuoteSource, TransientFetchError};
pub use retry::RetryPolicy;
