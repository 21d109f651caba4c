//! SQLite-backed price store.
//!
//! Append-only table `crypto_prices` with a uniqueness constraint on
//! (coin, currency, last_updated_at). Inserts resolve exactly that conflict
//! as a no-op; any other failure aborts the batch's transaction, so a batch
//! is either fully visible or not at all.
//!
//! Encoding:
//! - `last_updated_at`: epoch seconds, so the dedup key is zone independent
//! - `fetched_at`: RFC 3339 text carrying the reporting-zone offset
//! - `price`: exact decimal text

use crate::config::StoreConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use pricefeed_core::domain::{PriceRecord, RunId};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Row cap applied by [`SqliteStore::query`] when `PriceQuery::limit` is unset.
pub const DEFAULT_QUERY_LIMIT: u32 = 1_000;
/// Largest row count [`SqliteStore::query`] and [`SqliteStore::run_summaries`] return.
pub const MAX_QUERY_LIMIT: u32 = 10_000;

// 6 binds per row keeps each statement well below SQLite's variable limit.
const INSERT_CHUNK: usize = 100;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS crypto_prices (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        coin TEXT NOT NULL,
        currency TEXT NOT NULL,
        price TEXT NOT NULL CHECK (CAST(price AS REAL) >= 0),
        last_updated_at INTEGER NOT NULL,
        etl_run_id TEXT NOT NULL,
        fetched_at TEXT NOT NULL,
        UNIQUE (coin, currency, last_updated_at)
    )",
    "CREATE INDEX IF NOT EXISTS idx_crypto_prices_run ON crypto_prices (etl_run_id)",
    "CREATE INDEX IF NOT EXISTS idx_crypto_prices_updated ON crypto_prices (last_updated_at)",
];

const SELECT_COLUMNS: &str =
    "SELECT coin, currency, price, last_updated_at, etl_run_id, fetched_at FROM crypto_prices";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Any driver-level failure: connection, lock timeout, constraint other
    /// than the dedup key. Fatal to the execution.
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    #[error("cannot create store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt row in crypto_prices: {0}")]
    Corrupt(String),
}

/// Destination for normalized records.
#[async_trait]
pub trait PriceSink: Send + Sync {
    /// Durably append `records` in one transaction. Returns how many rows
    /// were newly inserted; records already present by key count as zero.
    async fn persist(&self, records: &[PriceRecord]) -> Result<u64, StoreError>;

    /// Total stored rows, for sinks that can report it.
    async fn total_rows(&self) -> Result<Option<u64>, StoreError> {
        Ok(None)
    }
}

/// Filter for [`SqliteStore::query`]. Unset fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceQuery {
    pub coin: Option<String>,
    pub currency: Option<String>,
    /// Inclusive lower bound on the source instant.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the source instant.
    pub until: Option<DateTime<Utc>>,
    /// Maximum rows returned. `None` means [`DEFAULT_QUERY_LIMIT`]; any value
    /// is clamped to `1..=MAX_QUERY_LIMIT`, so a full result set can be cut
    /// short without an error.
    pub limit: Option<u32>,
}

impl PriceQuery {
    pub fn for_coin(coin: impl Into<String>) -> Self {
        Self {
            coin: Some(coin.into()),
            ..Self::default()
        }
    }
}

/// Per-run audit line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub records: u64,
    pub fetched_at: DateTime<Tz>,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    zone: Tz,
}

impl SqliteStore {
    /// Open (creating if needed) the database described by `config` and
    /// apply the schema. Reads are reported in `zone`.
    pub async fn connect(config: &StoreConfig, zone: Tz) -> Result<Self, StoreError> {
        if let Some(path) = database_path(&config.url) {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        tracing::debug!(url = %config.url, "connected to price store");
        let store = Self { pool, zone };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, for tests and dry runs.
    pub async fn in_memory(zone: Tz) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection to :memory: is a separate database, so pin one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool, zone };
        store.migrate().await?;
        Ok(store)
    }

    /// Create the table and indexes if absent. Safe to call repeatedly.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM crypto_prices")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Records matching `query`, newest source instant first.
    pub async fn query(&self, query: &PriceQuery) -> Result<Vec<PriceRecord>, StoreError> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);

        let mut sql = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        sql.push(" WHERE 1 = 1");
        if let Some(coin) = &query.coin {
            sql.push(" AND coin = ").push_bind(coin.clone());
        }
        if let Some(currency) = &query.currency {
            sql.push(" AND currency = ").push_bind(currency.clone());
        }
        if let Some(since) = query.since {
            sql.push(" AND last_updated_at >= ").push_bind(since.timestamp());
        }
        if let Some(until) = query.until {
            sql.push(" AND last_updated_at <= ").push_bind(until.timestamp());
        }
        sql.push(" ORDER BY last_updated_at DESC, coin ASC, currency ASC LIMIT ")
            .push_bind(i64::from(limit));

        let rows = sql.build().fetch_all(&self.pool).await?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    /// Every record a given run inserted, ordered by coin then currency.
    pub async fn records_for_run(&self, run_id: RunId) -> Result<Vec<PriceRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE etl_run_id = ? ORDER BY coin ASC, currency ASC");
        let rows = sqlx::query(&sql)
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    /// Most recent runs that stored at least one row.
    pub async fn run_summaries(&self, limit: u32) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT etl_run_id, COUNT(*) AS records, MIN(fetched_at) AS fetched_at
             FROM crypto_prices
             GROUP BY etl_run_id
             ORDER BY MAX(id) DESC
             LIMIT ?",
        )
        .bind(i64::from(limit.clamp(1, MAX_QUERY_LIMIT)))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RunSummary, StoreError> {
                let records: i64 = row.try_get("records")?;
                Ok(RunSummary {
                    run_id: parse_run_id(row.try_get("etl_run_id")?)?,
                    records: records.max(0) as u64,
                    fetched_at: self.parse_fetched_at(row.try_get("fetched_at")?)?,
                })
            })
            .collect()
    }

    fn decode(&self, row: &SqliteRow) -> Result<PriceRecord, StoreError> {
        let price: String = row.try_get("price")?;
        let price = Decimal::from_str(&price)
            .map_err(|e| StoreError::Corrupt(format!("price '{price}': {e}")))?;

        let epoch: i64 = row.try_get("last_updated_at")?;
        let last_updated_at = DateTime::from_timestamp(epoch, 0)
            .ok_or_else(|| StoreError::Corrupt(format!("last_updated_at {epoch} out of range")))?
            .with_timezone(&self.zone);

        Ok(PriceRecord {
            coin: row.try_get("coin")?,
            currency: row.try_get("currency")?,
            price,
            last_updated_at,
            etl_run_id: parse_run_id(row.try_get("etl_run_id")?)?,
            fetched_at: self.parse_fetched_at(row.try_get("fetched_at")?)?,
        })
    }

    fn parse_fetched_at(&self, text: String) -> Result<DateTime<Tz>, StoreError> {
        DateTime::parse_from_rfc3339(&text)
            .map(|t| t.with_timezone(&self.zone))
            .map_err(|e| StoreError::Corrupt(format!("fetched_at '{text}': {e}")))
    }
}

#[async_trait]
impl PriceSink for SqliteStore {
    async fn persist(&self, records: &[PriceRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        // Dropping `tx` on any early return rolls the whole batch back.
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut sql = QueryBuilder::<Sqlite>::new(
                "INSERT INTO crypto_prices (coin, currency, price, last_updated_at, etl_run_id, fetched_at) ",
            );
            sql.push_values(chunk, |mut row, record| {
                row.push_bind(record.coin.clone())
                    .push_bind(record.currency.clone())
                    .push_bind(record.price.normalize().to_string())
                    .push_bind(record.last_updated_at.timestamp())
                    .push_bind(record.etl_run_id.to_string())
                    .push_bind(record.fetched_at.to_rfc3339());
            });
            sql.push(" ON CONFLICT (coin, currency, last_updated_at) DO NOTHING");

            inserted += sql.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        tracing::debug!(
            submitted = records.len(),
            inserted,
            duplicates = records.len() as u64 - inserted,
            "batch persisted"
        );
        Ok(inserted)
    }

    async fn total_rows(&self) -> Result<Option<u64>, StoreError> {
        self.count().await.map(Some)
    }
}

fn parse_run_id(text: String) -> Result<RunId, StoreError> {
    RunId::from_str(&text).map_err(|e| StoreError::Corrupt(format!("etl_run_id '{text}': {e}")))
}

/// Filesystem path behind a SQLite URL, or `None` for in-memory databases.
fn database_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}
