//! Pricefeed Core — quote acquisition and record normalization.
//!
//! This crate contains the parts of the price pipeline that do not touch
//! storage:
//! - Domain types (quote requests, asset quotes, price records, run ids)
//! - An injectable clock
//! - The `QuoteSource` trait and the CoinGecko client behind it, with bounded
//!   retry, `Retry-After` handling and a circuit breaker
//! - A TTL response cache for any quote source
//! - The normalizer that turns quotes into timezone-aware records

pub mod clock;
pub mod data;
pub mod domain;
pub mod normalize;

pub use clock::{Clock, FixedClock, SystemClock};
pub use normalize::{NormalizedBatch, Normalizer, PartialDataWarning};
