//! Quote requests and the per-asset quotes returned by a quote source.

use super::{CoinId, CurrencyCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Rejected request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRequest {
    #[error("at least one asset identifier is required")]
    NoAssets,

    #[error("at least one currency is required")]
    NoCurrencies,

    #[error("invalid {kind} token '{token}': must be a non-empty lowercase token without commas or whitespace")]
    BadToken { kind: &'static str, token: String },
}

/// A validated batch request: every asset priced in every currency.
///
/// Both sets are ordered so the outgoing query string and the normalized
/// record order are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuoteRequest {
    coins: BTreeSet<CoinId>,
    currencies: BTreeSet<CurrencyCode>,
}

impl QuoteRequest {
    pub fn new<C, V>(coins: C, currencies: V) -> Result<Self, InvalidRequest>
    where
        C: IntoIterator,
        C::Item: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        let coins = collect_tokens(coins, "asset")?;
        let currencies = collect_tokens(currencies, "currency")?;

        if coins.is_empty() {
            return Err(InvalidRequest::NoAssets);
        }
        if currencies.is_empty() {
            return Err(InvalidRequest::NoCurrencies);
        }

        Ok(Self { coins, currencies })
    }

    pub fn coins(&self) -> &BTreeSet<CoinId> {
        &self.coins
    }

    pub fn currencies(&self) -> &BTreeSet<CurrencyCode> {
        &self.currencies
    }

    /// Comma-joined asset identifiers for the `ids` query parameter.
    pub fn ids_param(&self) -> String {
        join(&self.coins)
    }

    /// Comma-joined currency codes for the `vs_currencies` query parameter.
    pub fn currencies_param(&self) -> String {
        join(&self.currencies)
    }
}

fn collect_tokens<I>(items: I, kind: &'static str) -> Result<BTreeSet<String>, InvalidRequest>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut out = BTreeSet::new();
    for item in items {
        let token: String = item.into();
        let valid = !token.is_empty()
            && !token.contains(',')
            && !token.chars().any(char::is_whitespace)
            && !token.chars().any(char::is_uppercase);
        if !valid {
            return Err(InvalidRequest::BadToken { kind, token });
        }
        out.insert(token);
    }
    Ok(out)
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Current prices for one asset as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetQuote {
    pub coin: CoinId,
    /// Price per requested currency that the upstream actually returned.
    pub prices: BTreeMap<CurrencyCode, Decimal>,
    /// Source-reported refresh instant, epoch seconds.
    pub last_updated_at: Option<i64>,
}
