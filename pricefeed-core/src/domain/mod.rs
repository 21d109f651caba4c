//! Domain types for the price pipeline

pub mod ids;
pub mod quote;
pub mod record;

pub use ids::RunId;
pub use quote::{AssetQuote, InvalidRequest, QuoteRequest};
pub use record::PriceRecord;

/// Asset identifier as understood by the upstream API (e.g. `bitcoin`).
pub type CoinId = String;

/// Lowercase currency code (e.g. `usd`).
pub type CurrencyCode = String;
