//! Integration tests for the SQLite price store.
//!
//! Covers the write guarantees (idempotence, key-based dedup across runs,
//! all-or-nothing batches) and the read API used for auditing.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Africa::Nairobi;
use chrono_tz::Tz;
use pricefeed_core::domain::{PriceRecord, RunId};
use pricefeed_runner::config::StoreConfig;
use pricefeed_runner::store::DEFAULT_QUERY_LIMIT;
use pricefeed_runner::{PriceQuery, PriceSink, SqliteStore, StoreError};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

const T0: i64 = 1_700_000_000;

fn at(secs: i64) -> DateTime<Tz> {
    Nairobi.from_utc_datetime(&DateTime::from_timestamp(secs, 0).unwrap().naive_utc())
}

fn record(coin: &str, currency: &str, price: &str, updated: i64, run: RunId) -> PriceRecord {
    PriceRecord {
        coin: coin.to_string(),
        currency: currency.to_string(),
        price: Decimal::from_str(price).unwrap(),
        last_updated_at: at(updated),
        etl_run_id: run,
        fetched_at: at(updated + 30),
    }
}

fn scenario_batch(run: RunId) -> Vec<PriceRecord> {
    vec![
        record("bitcoin", "usd", "50000", T0, run),
        record("ethereum", "usd", "3000", T0, run),
    ]
}

async fn store() -> SqliteStore {
    SqliteStore::in_memory(Nairobi).await.unwrap()
}

#[tokio::test]
async fn persisting_twice_inserts_once() {
    let store = store().await;
    let batch = scenario_batch(RunId::new());

    assert_eq!(store.persist(&batch).await.unwrap(), 2);
    assert_eq!(store.persist(&batch).await.unwrap(), 0);
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test]
async fn dedup_is_by_key_not_by_run() {
    let store = store().await;
    let first = RunId::new();
    let second = RunId::new();

    store.persist(&scenario_batch(first)).await.unwrap();
    let inserted = store.persist(&scenario_batch(second)).await.unwrap();

    assert_eq!(inserted, 0);
    assert_eq!(store.count().await.unwrap(), 2);
    // The first writer keeps ownership of the row.
    assert_eq!(store.records_for_run(first).await.unwrap().len(), 2);
    assert!(store.records_for_run(second).await.unwrap().is_empty());
}

#[tokio::test]
async fn partially_new_batch_counts_only_new_rows() {
    let store = store().await;
    let run = RunId::new();
    store.persist(&scenario_batch(run)).await.unwrap();

    let mut next = scenario_batch(RunId::new());
    next.push(record("bitcoin", "usd", "50100", T0 + 60, RunId::new()));

    assert_eq!(store.persist(&next).await.unwrap(), 1);
    assert_eq!(store.count().await.unwrap(), 3);
}

#[tokio::test]
async fn failing_batch_leaves_no_rows() {
    let store = store().await;
    let run = RunId::new();
    let batch = vec![
        record("bitcoin", "usd", "50000", T0, run),
        record("ethereum", "usd", "3000", T0, run),
        // Violates the non-negative price check after two good rows.
        record("solana", "usd", "-1", T0, run),
        record("cardano", "usd", "0.35", T0, run),
    ];

    let err = store.persist(&batch).await.unwrap_err();

    assert!(matches!(err, StoreError::Unavailable(_)));
    assert_eq!(store.count().await.unwrap(), 0);
    assert!(store.records_for_run(run).await.unwrap().is_empty());
}

#[tokio::test]
async fn failure_in_a_later_chunk_rolls_back_earlier_chunks() {
    let store = store().await;
    let run = RunId::new();
    // 150 good rows fill the first insert statement before the bad one is reached.
    let mut batch: Vec<_> = (0..150)
        .map(|i| record("bitcoin", "usd", "1", T0 + i, run))
        .collect();
    batch.push(record("solana", "usd", "-1", T0, run));

    let err = store.persist(&batch).await.unwrap_err();

    assert!(matches!(err, StoreError::Unavailable(_)));
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn large_batches_span_several_statements() {
    let store = store().await;
    let run = RunId::new();
    let batch: Vec<_> = (0..250)
        .map(|i| record("bitcoin", "usd", "1", T0 + i, run))
        .collect();

    assert_eq!(store.persist(&batch).await.unwrap(), 250);
    assert_eq!(store.persist(&batch).await.unwrap(), 0);
}

#[tokio::test]
async fn values_round_trip_exactly() {
    let store = store().await;
    let run = RunId::new();
    let original = record("bitcoin", "usd", "0.000012345678901234", T0, run);
    store.persist(std::slice::from_ref(&original)).await.unwrap();

    let back = store.records_for_run(run).await.unwrap();

    assert_eq!(back, vec![original]);
    assert_eq!(back[0].last_updated_at.timezone(), Nairobi);
    assert_eq!(back[0].fetched_at.to_rfc3339(), "2023-11-15T01:13:50+03:00");
}

#[tokio::test]
async fn query_orders_newest_first_and_filters() {
    let store = store().await;
    let run = RunId::new();
    store
        .persist(&[
            record("bitcoin", "usd", "1", T0, run),
            record("bitcoin", "eur", "1", T0 + 100, run),
            record("bitcoin", "usd", "2", T0 + 200, run),
            record("ethereum", "usd", "3", T0 + 100, run),
        ])
        .await
        .unwrap();

    let all = store.query(&PriceQuery::default()).await.unwrap();
    let order: Vec<_> = all
        .iter()
        .map(|r| (r.coin.as_str(), r.currency.as_str(), r.last_updated_at.timestamp()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("bitcoin", "usd", T0 + 200),
            ("bitcoin", "eur", T0 + 100),
            ("ethereum", "usd", T0 + 100),
            ("bitcoin", "usd", T0),
        ]
    );

    let btc_usd = store
        .query(&PriceQuery {
            currency: Some("usd".into()),
            ..PriceQuery::for_coin("bitcoin")
        })
        .await
        .unwrap();
    assert_eq!(btc_usd.len(), 2);

    let window = store
        .query(&PriceQuery {
            since: Some(Utc.timestamp_opt(T0 + 50, 0).unwrap()),
            until: Some(Utc.timestamp_opt(T0 + 150, 0).unwrap()),
            ..PriceQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(window.len(), 2);
    assert!(window.iter().all(|r| r.last_updated_at.timestamp() == T0 + 100));

    let limited = store
        .query(&PriceQuery {
            limit: Some(1),
            ..PriceQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].last_updated_at.timestamp(), T0 + 200);

    let zero = store
        .query(&PriceQuery {
            limit: Some(0),
            ..PriceQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(zero.len(), 1, "limits are clamped to at least one row");
}

#[tokio::test]
async fn unbounded_query_stops_at_default_limit() {
    let store = store().await;
    let run = RunId::new();
    let total = i64::from(DEFAULT_QUERY_LIMIT) + 5;
    let batch: Vec<_> = (0..total)
        .map(|i| record("bitcoin", "usd", "1", T0 + i, run))
        .collect();
    store.persist(&batch).await.unwrap();

    let rows = store.query(&PriceQuery::default()).await.unwrap();

    assert_eq!(rows.len(), DEFAULT_QUERY_LIMIT as usize);
    assert_eq!(rows[0].last_updated_at.timestamp(), T0 + total - 1);
    assert_eq!(store.count().await.unwrap(), total as u64);
}

#[tokio::test]
async fn run_summaries_list_latest_run_first() {
    let store = store().await;
    let older = RunId::new();
    let newer = RunId::new();
    store.persist(&scenario_batch(older)).await.unwrap();
    store
        .persist(&[record("bitcoin", "usd", "51000", T0 + 300, newer)])
        .await
        .unwrap();

    let runs = store.run_summaries(10).await.unwrap();

    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, newer);
    assert_eq!(runs[0].records, 1);
    assert_eq!(runs[1].run_id, older);
    assert_eq!(runs[1].records, 2);
    assert_eq!(runs[1].fetched_at, at(T0 + 30));
}

#[tokio::test]
async fn file_store_creates_directories_and_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/data/crypto.db");
    let config = StoreConfig {
        url: format!("sqlite://{}", path.display()),
        ..StoreConfig::default()
    };
    let run = RunId::new();

    {
        let store = SqliteStore::connect(&config, Nairobi).await.unwrap();
        assert_eq!(store.persist(&scenario_batch(run)).await.unwrap(), 2);
    }
    assert!(path.exists());

    let reopened = SqliteStore::connect(&config, Nairobi).await.unwrap();
    assert_eq!(reopened.count().await.unwrap(), 2);
    assert_eq!(reopened.persist(&scenario_batch(RunId::new())).await.unwrap(), 0);
    assert_eq!(reopened.total_rows().await.unwrap(), Some(2));
}

/// GIVEN two connections to one database file
/// WHEN several executions persist the same keys at the same time
/// THEN every write succeeds and each key is inserted exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_writers_share_one_file_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        url: format!("sqlite://{}", dir.path().join("crypto.db").display()),
        ..StoreConfig::default()
    };
    let stores = [
        Arc::new(SqliteStore::connect(&config, Nairobi).await.unwrap()),
        Arc::new(SqliteStore::connect(&config, Nairobi).await.unwrap()),
    ];

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let store = stores[n % 2].clone();
            let run = RunId::new();
            let batch: Vec<_> = (0..300)
                .map(|i| record("bitcoin", "usd", "1", T0 + i, run))
                .collect();
            tokio::spawn(async move { store.persist(&batch).await })
        })
        .collect();

    let mut inserted = 0;
    for handle in handles {
        inserted += handle.await.unwrap().unwrap();
    }

    assert_eq!(inserted, 300);
    assert_eq!(stores[0].count().await.unwrap(), 300);
    assert_eq!(stores[1].count().await.unwrap(), 300);
}
