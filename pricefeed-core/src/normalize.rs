//! Response-to-record normalization.
//!
//! Flattens per-asset quotes into one `PriceRecord` per (asset, currency),
//! stamps the run identity, and converts every instant into the reporting
//! zone. Pure: the only input that varies between calls with equal arguments
//! is `now`, and that is passed in.

use crate::data::QuoteMap;
use crate::domain::{CoinId, CurrencyCode, PriceRecord, QuoteRequest, RunId};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;

/// Non-fatal gaps in an upstream response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartialDataWarning {
    #[error("no quote returned for '{coin}'")]
    MissingAsset { coin: CoinId },

    #[error("no {currency} price returned for '{coin}'")]
    MissingCurrency { coin: CoinId, currency: CurrencyCode },

    #[error("implausible last_updated_at {reported} for '{coin}', records skipped")]
    ImplausibleTimestamp { coin: CoinId, reported: i64 },
}

/// Records of one run plus whatever was missing from the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub run_id: RunId,
    pub records: Vec<PriceRecord>,
    pub warnings: Vec<PartialDataWarning>,
}

impl NormalizedBatch {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    zone: Tz,
    clock_skew: Duration,
}

impl Normalizer {
    /// Normalizer reporting in `zone`, tolerating five minutes of clock skew.
    pub fn new(zone: Tz) -> Self {
        Self {
            zone,
            clock_skew: Duration::minutes(5),
        }
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn to_zone(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        self.zone.from_utc_datetime(&instant.naive_utc())
    }

    /// Flatten `quotes` for `request` into records belonging to `run_id`.
    ///
    /// Output order is asset then currency, both ascending. A missing source
    /// instant defaults to `now`.
    pub fn normalize(
        &self,
        request: &QuoteRequest,
        quotes: &QuoteMap,
        run_id: RunId,
        now: DateTime<Utc>,
    ) -> NormalizedBatch {
        let fetched_at = self.to_zone(now);
        let mut records = Vec::with_capacity(request.coins().len() * request.currencies().len());
        let mut warnings = Vec::new();

        for coin in request.coins() {
            let Some(quote) = quotes.get(coin) else {
                warnings.push(PartialDataWarning::MissingAsset { coin: coin.clone() });
                continue;
            };

            let source_instant = match quote.last_updated_at {
                None => now,
                Some(reported) => match self.plausible_instant(reported, now) {
                    Some(instant) => instant,
                    None => {
                        warnings.push(PartialDataWarning::ImplausibleTimestamp {
                            coin: coin.clone(),
                            reported,
                        });
                        continue;
                    }
                },
            };
            let last_updated_at = self.to_zone(source_instant);

            for currency in request.currencies() {
                match quote.prices.get(currency) {
                    Some(price) => records.push(PriceRecord {
                        coin: coin.clone(),
                        currency: currency.clone(),
                        price: *price,
                        last_updated_at,
                        etl_run_id: run_id,
                        fetched_at,
                    }),
                    None => warnings.push(PartialDataWarning::MissingCurrency {
                        coin: coin.clone(),
                        currency: currency.clone(),
                    }),
                }
            }
        }

        NormalizedBatch {
            run_id,
            records,
            warnings,
        }
    }

    fn plausible_instant(&self, reported: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if reported < 0 {
            return None;
        }
        let instant = DateTime::from_timestamp(reported, 0)?;
        (instant <= now + self.clock_skew).then_some(instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AssetQuote;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    const NOW: i64 = 1_700_000_600;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(NOW, 0).unwrap()
    }

    fn quote(coin: &str, prices: &[(&str, i64)], updated: Option<i64>) -> (String, AssetQuote) {
        (
            coin.to_string(),
            AssetQuote {
                coin: coin.to_string(),
                prices: prices
                    .iter()
                    .map(|(c, p)| (c.to_string(), Decimal::from(*p)))
                    .collect(),
                last_updated_at: updated,
            },
        )
    }

    fn nairobi() -> Normalizer {
        Normalizer::new(chrono_tz::Africa::Nairobi)
    }

    #[test]
    fn two_assets_one_run() {
        let req = QuoteRequest::new(["bitcoin", "ethereum"], ["usd"]).unwrap();
        let quotes: QuoteMap = [
            quote("bitcoin", &[("usd", 50_000)], Some(1_700_000_000)),
            quote("ethereum", &[("usd", 3_000)], Some(1_700_000_000)),
        ]
        .into_iter()
        .collect();
        let run_id = RunId::new();

        let batch = nairobi().normalize(&req, &quotes, run_id, now());

        assert!(batch.is_complete());
        assert_eq!(batch.records.len(), 2);
        assert!(batch.records.iter().all(|r| r.etl_run_id == run_id));
        assert_eq!(batch.records[0].coin, "bitcoin");
        assert_eq!(batch.records[0].price, Decimal::from(50_000));
        assert_eq!(batch.records[1].coin, "ethereum");
        assert_eq!(batch.records[1].last_updated_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn timestamps_are_in_reporting_zone() {
        let req = QuoteRequest::new(["bitcoin"], ["usd"]).unwrap();
        let quotes: QuoteMap = [quote("bitcoin", &[("usd", 1)], Some(1_700_000_000))]
            .into_iter()
            .collect();

        let batch = nairobi().normalize(&req, &quotes, RunId::new(), now());
        let record = &batch.records[0];

        assert_eq!(record.last_updated_at.timezone(), chrono_tz::Africa::Nairobi);
        // 2023-11-14T22:13:20Z is 01:13:20 the next day in Nairobi (UTC+3).
        assert_eq!(
            record.last_updated_at.to_rfc3339(),
            "2023-11-15T01:13:20+03:00"
        );
        assert_eq!(record.fetched_at.timestamp(), NOW);
    }

    #[test]
    fn missing_currency_is_one_warning_per_pair() {
        let req = QuoteRequest::new(["bitcoin", "ethereum"], ["eur", "usd"]).unwrap();
        let quotes: QuoteMap = [
            quote("bitcoin", &[("usd", 50_000)], Some(1_700_000_000)),
            quote("ethereum", &[("usd", 3_000), ("eur", 2_800)], Some(1_700_000_000)),
        ]
        .into_iter()
        .collect();

        let batch = nairobi().normalize(&req, &quotes, RunId::new(), now());

        assert_eq!(batch.records.len(), 3);
        assert_eq!(
            batch.warnings,
            vec![PartialDataWarning::MissingCurrency {
                coin: "bitcoin".into(),
                currency: "eur".into()
            }]
        );
    }

    #[test]
    fn missing_asset_is_reported_once() {
        let req = QuoteRequest::new(["bitcoin", "terra-luna"], ["eur", "usd"]).unwrap();
        let quotes: QuoteMap = [quote("bitcoin", &[("usd", 1), ("eur", 1)], Some(1))]
            .into_iter()
            .collect();

        let batch = nairobi().normalize(&req, &quotes, RunId::new(), now());

        assert_eq!(batch.records.len(), 2);
        assert_eq!(
            batch.warnings,
            vec![PartialDataWarning::MissingAsset {
                coin: "terra-luna".into()
            }]
        );
    }

    #[test]
    fn absent_source_instant_defaults_to_now() {
        let req = QuoteRequest::new(["bitcoin"], ["usd"]).unwrap();
        let quotes: QuoteMap = [quote("bitcoin", &[("usd", 1)], None)].into_iter().collect();

        let batch = nairobi().normalize(&req, &quotes, RunId::new(), now());

        assert_eq!(batch.records[0].last_updated_at.timestamp(), NOW);
        assert_eq!(batch.records[0].last_updated_at, batch.records[0].fetched_at);
    }

    #[test]
    fn future_instant_beyond_skew_is_skipped() {
        let req = QuoteRequest::new(["bitcoin", "ethereum"], ["usd"]).unwrap();
        let quotes: QuoteMap = [
            quote("bitcoin", &[("usd", 1)], Some(NOW + 3_600)),
            quote("ethereum", &[("usd", 1)], Some(NOW + 60)),
        ]
        .into_iter()
        .collect();

        let batch = nairobi().normalize(&req, &quotes, RunId::new(), now());

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].coin, "ethereum");
        assert_eq!(
            batch.warnings,
            vec![PartialDataWarning::ImplausibleTimestamp {
                coin: "bitcoin".into(),
                reported: NOW + 3_600
            }]
        );
    }

    #[test]
    fn tighter_skew_rejects_small_drift() {
        let req = QuoteRequest::new(["bitcoin"], ["usd"]).unwrap();
        let quotes: QuoteMap = [quote("bitcoin", &[("usd", 1)], Some(NOW + 60))]
            .into_iter()
            .collect();

        let batch = nairobi()
            .with_clock_skew(Duration::seconds(10))
            .normalize(&req, &quotes, RunId::new(), now());

        assert!(batch.records.is_empty());
        assert_eq!(batch.warnings.len(), 1);
    }

    #[test]
    fn deterministic_for_equal_inputs() {
        let req = QuoteRequest::new(["bitcoin", "ethereum"], ["usd", "eur"]).unwrap();
        let quotes: QuoteMap = [
            quote("ethereum", &[("usd", 3_000)], Some(1_700_000_000)),
            quote("bitcoin", &[("eur", 46_000), ("usd", 50_000)], Some(1_700_000_000)),
        ]
        .into_iter()
        .collect();
        let run_id = RunId::new();

        let a = nairobi().normalize(&req, &quotes, run_id, now());
        let b = nairobi().normalize(&req, &quotes, run_id, now());
        assert_eq!(a, b);
    }

    proptest! {
        /// Every requested pair ends up either as a record or as exactly one
        /// missing-currency warning, never both and never neither.
        #[test]
        fn every_pair_accounted_for(present in proptest::collection::vec(any::<bool>(), 6)) {
            let coins = ["bitcoin", "ethereum"];
            let currencies = ["eur", "gbp", "usd"];
            let req = QuoteRequest::new(coins, currencies).unwrap();

            let mut quotes = QuoteMap::new();
            let mut expected_missing = 0;
            for (i, coin) in coins.iter().enumerate() {
                let mut prices = BTreeMap::new();
                for (j, cur) in currencies.iter().enumerate() {
                    if present[i * currencies.len() + j] {
                        prices.insert(cur.to_string(), Decimal::from(100));
                    } else {
                        expected_missing += 1;
                    }
                }
                quotes.insert(coin.to_string(), AssetQuote {
                    coin: coin.to_string(),
                    prices,
                    last_updated_at: Some(1_700_000_000),
                });
            }

            let batch = nairobi().normalize(&req, &quotes, RunId::new(), now());

            prop_assert_eq!(batch.warnings.len(), expected_missing);
            prop_assert_eq!(batch.records.len() + batch.warnings.len(), 6);
            let only_currency = batch
                .warnings
                .iter()
                .all(|w| matches!(w, PartialDataWarning::MissingCurrency { .. }));
            prop_assert!(only_currency);
        }
    }
}
