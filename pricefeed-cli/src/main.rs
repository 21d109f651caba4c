//! Pricefeed CLI — run the price pipeline and inspect what it stored.
//!
//! Commands:
//! - `run`: one fetch, normalize and persist execution
//! - `serve`: repeat `run` on a fixed interval until Ctrl-C
//! - `history`: stored prices, newest first, optionally exported as CSV
//! - `runs`: per-run audit summary
//! - `show-run`: every record a single run stored
//! - `config`: print the effective configuration

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use pricefeed_core::data::{CachedQuoteSource, CircuitBreaker, CoinGeckoClient};
use pricefeed_core::domain::{PriceRecord, RunId};
use pricefeed_core::{Clock, SystemClock};
use pricefeed_runner::{
    init_logging, IntervalScheduler, Pipeline, PipelineConfig, PriceQuery, RunOnce, RunReport,
    ScheduleSummary, Scheduler, SqliteStore,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_CONFIG_FILE: &str = "pricefeed.toml";

#[derive(Parser)]
#[command(
    name = "pricefeed",
    version,
    about = "Pricefeed CLI: crypto price ETL into SQLite"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to ./pricefeed.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, normalize and store prices once.
    Run,
    /// Run the pipeline on a fixed interval until interrupted.
    Serve {
        /// Seconds between runs. Overrides schedule.interval_secs.
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Stop after this many runs.
        #[arg(long)]
        max_runs: Option<u32>,
    },
    /// Query stored prices, newest source time first.
    History {
        #[arg(long)]
        coin: Option<String>,

        #[arg(long)]
        currency: Option<String>,

        /// Earliest source time (RFC 3339).
        #[arg(long)]
        since: Option<String>,

        /// Latest source time (RFC 3339).
        #[arg(long)]
        until: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: u32,

        /// Write the result to this CSV file instead of printing a table.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// List recent runs with their record counts.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show every record stored by one run.
    ShowRun {
        /// Run identifier (UUID).
        run_id: String,
    },
    /// Print the effective configuration with secrets redacted.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_redacted_toml()?);
        return Ok(());
    }

    init_logging(&config.logging).map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Run => run_once_cmd(&config).await,
        Commands::Serve {
            interval_secs,
            max_runs,
        } => serve_cmd(&config, interval_secs, max_runs).await,
        Commands::History {
            coin,
            currency,
            since,
            until,
            limit,
            csv,
        } => {
            let query = PriceQuery {
                coin,
                currency,
                since: since.as_deref().map(parse_instant).transpose()?,
                until: until.as_deref().map(parse_instant).transpose()?,
                limit: Some(limit),
            };
            history_cmd(&config, &query, csv.as_deref()).await
        }
        Commands::Runs { limit } => runs_cmd(&config, limit).await,
        Commands::ShowRun { run_id } => show_run_cmd(&config, &run_id).await,
        Commands::Config => Ok(()),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            PipelineConfig::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => PipelineConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn parse_instant(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("invalid RFC 3339 time '{text}'"))?
        .with_timezone(&Utc))
}

async fn open_store(config: &PipelineConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::connect(&config.store, config.reporting.zone()?)
        .await
        .with_context(|| format!("opening store {}", config.store.url))?;
    Ok(Arc::new(store))
}

async fn build_pipeline(config: &PipelineConfig) -> Result<(Pipeline, Arc<SqliteStore>)> {
    let store = open_store(config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let circuit_breaker = Arc::new(CircuitBreaker::new(config.api.breaker_cooldown()));
    let client = CoinGeckoClient::new(config.api.client_config(), circuit_breaker)?
        .with_clock(clock.clone());
    let source = CachedQuoteSource::new(client, config.api.cache_ttl(), clock.clone());

    let pipeline = Pipeline::new(config, Arc::new(source), store.clone(), clock)?;
    Ok((pipeline, store))
}

async fn run_once_cmd(config: &PipelineConfig) -> Result<()> {
    let (pipeline, store) = build_pipeline(config).await?;
    let (pipeline, store) = (&pipeline, &store);

    let summary = RunOnce
        .schedule(|| async move {
            let report = pipeline.run_once().await;
            print_report(&report, store).await;
            report
        })
        .await;

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn serve_cmd(
    config: &PipelineConfig,
    interval_secs: Option<u64>,
    max_runs: Option<u32>,
) -> Result<()> {
    let (pipeline, store) = build_pipeline(config).await?;
    let (pipeline, store) = (&pipeline, &store);

    let interval = interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.schedule.interval());
    anyhow::ensure!(!interval.is_zero(), "--interval-secs must be at least 1");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, finishing current run");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for Ctrl-C, stop the process to exit");
                // A dropped sender stops the scheduler, so hold it forever.
                let _held = shutdown_tx;
                std::future::pending::<()>().await;
            }
        }
    });

    let mut scheduler = IntervalScheduler::new(interval, shutdown_rx);
    if let Some(max) = max_runs {
        scheduler = scheduler.with_max_runs(max);
    }

    let summary = scheduler
        .schedule(|| async move {
            let report = pipeline.run_once().await;
            print_report(&report, store).await;
            report
        })
        .await;

    print_schedule_summary(&summary);
    Ok(())
}

async fn history_cmd(config: &PipelineConfig, query: &PriceQuery, csv: Option<&Path>) -> Result<()> {
    let store = open_store(config).await?;
    let records = store.query(query).await?;

    match csv {
        Some(path) => {
            write_csv(path, &records)?;
            println!("Wrote {} records to {}", records.len(), path.display());
        }
        None => print_records(&records),
    }
    Ok(())
}

async fn runs_cmd(config: &PipelineConfig, limit: u32) -> Result<()> {
    let store = open_store(config).await?;
    let runs = store.run_summaries(limit).await?;

    if runs.is_empty() {
        println!("No runs stored yet.");
        return Ok(());
    }

    println!("{:<36}  {:>7}  {}", "RUN ID", "RECORDS", "FETCHED AT");
    for run in &runs {
        println!(
            "{:<36}  {:>7}  {}",
            run.run_id,
            run.records,
            run.fetched_at.format("%Y-%m-%d %H:%M:%S %Z")
        );
    }
    Ok(())
}

async fn show_run_cmd(config: &PipelineConfig, run_id: &str) -> Result<()> {
    let run_id = RunId::from_str(run_id).with_context(|| format!("invalid run id '{run_id}'"))?;
    let store = open_store(config).await?;
    let records = store.records_for_run(run_id).await?;

    if records.is_empty() {
        println!("Run {run_id} stored no records.");
    } else {
        print_records(&records);
    }
    Ok(())
}

async fn print_report(report: &RunReport, store: &SqliteStore) {
    println!();
    println!("Run {}: {}", report.run_id, report.state);

    if !report.records.is_empty() {
        print_records(&report.records);
        println!(
            "{} records, {} new, {} already stored",
            report.records.len(),
            report.inserted,
            report.records.len() as u64 - report.inserted
        );
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    if let Some(error) = &report.error {
        println!("  error: {error}");
    }
    if let Ok(total) = store.count().await {
        println!("Total rows in store: {total}");
    }
}

fn print_records(records: &[PriceRecord]) {
    println!(
        "{:<16}  {:<8}  {:>20}  {}",
        "COIN", "CURRENCY", "PRICE", "SOURCE TIME"
    );
    for record in records {
        println!(
            "{:<16}  {:<8}  {:>20}  {}",
            record.coin,
            record.currency,
            record.price,
            record.last_updated_at.format("%Y-%m-%d %H:%M:%S %Z")
        );
    }
}

fn print_schedule_summary(summary: &ScheduleSummary) {
    println!();
    println!("=== Schedule Summary ===");
    println!("Runs:           {}", summary.runs);
    println!("Succeeded:      {}", summary.succeeded);
    println!("With warnings:  {}", summary.with_warnings);
    println!("Failed:         {}", summary.failed);
}

fn write_csv(path: &Path, records: &[PriceRecord]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}
