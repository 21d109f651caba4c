//! Pricefeed Runner — configuration, storage, coordination and scheduling.
//!
//! This crate builds on `pricefeed-core` to provide:
//! - `PipelineConfig` loading from TOML plus environment overrides
//! - The SQLite price store (idempotent batch writes, audit queries)
//! - The pipeline coordinator and its run state machine
//! - Run-once and fixed-interval schedulers
//! - Tracing subscriber initialization

pub mod config;
pub mod logging;
pub mod pipeline;
pub mod schedule;
pub mod store;

pub use config::{ConfigError, PipelineConfig};
pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use pipeline::{Pipeline, PipelineError, RunReport, RunState};
pub use schedule::{IntervalScheduler, RunOnce, ScheduleSummary, Scheduler};
pub use store::{PriceQuery, PriceSink, RunSummary, SqliteStore, StoreError};
