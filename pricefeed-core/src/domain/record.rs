use super::{CoinId, CurrencyCode, RunId};
use chrono::DateTime;
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::Serialize;

/// One normalized price observation, ready to persist.
///
/// `(coin, currency, last_updated_at)` is the logical identity of a sample;
/// the same sample seen by two runs is still one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceRecord {
    pub coin: CoinId,
    pub currency: CurrencyCode,
    pub price: Decimal,
    /// Source refresh instant in the reporting zone.
    pub last_updated_at: DateTime<Tz>,
    pub etl_run_id: RunId,
    /// When this pipeline created the record, in the reporting zone.
    pub fetched_at: DateTime<Tz>,
}

impl PriceRecord {
    /// Composite dedup key.
    pub fn key(&self) -> (&str, &str, i64) {
        (&self.coin, &self.currency, self.last_updated_at.timestamp())
    }
}
