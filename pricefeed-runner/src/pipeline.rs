//! Pipeline coordinator: one fetch → normalize → persist execution.
//!
//! Steps run strictly in sequence. The coordinator never retries a whole
//! execution; that is left to whatever schedules it. Every execution yields
//! a [`RunReport`], whether it succeeded or not.

use crate::config::{ConfigError, PipelineConfig};
use crate::store::{PriceSink, StoreError};
use chrono::DateTime;
use chrono_tz::Tz;
use pricefeed_core::data::{FetchError, QuoteSource};
use pricefeed_core::domain::{PriceRecord, QuoteRequest, RunId};
use pricefeed_core::{Clock, Normalizer, PartialDataWarning};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Extracting,
    Transforming,
    Loading,
    Succeeded,
    CompletedWithWarnings,
    Failed,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Extracting)
                | (Extracting, Transforming)
                | (Extracting, Failed)
                | (Transforming, Loading)
                | (Loading, Succeeded)
                | (Loading, CompletedWithWarnings)
                | (Loading, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::CompletedWithWarnings | RunState::Failed
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::CompletedWithWarnings)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "IDLE",
            RunState::Extracting => "EXTRACTING",
            RunState::Transforming => "TRANSFORMING",
            RunState::Loading => "LOADING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::CompletedWithWarnings => "COMPLETED_WITH_WARNINGS",
            RunState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Why an execution ended in `FAILED`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extract failed: {0}")]
    Extract(#[from] FetchError),

    #[error("load failed: {0}")]
    Load(#[from] StoreError),
}

/// Outcome of one execution.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: RunState,
    /// Every state visited, starting with `Idle`.
    pub transitions: Vec<RunState>,
    pub started_at: DateTime<Tz>,
    pub finished_at: Option<DateTime<Tz>>,
    pub assets_fetched: usize,
    /// The durable batch. Empty unless loading succeeded.
    pub records: Vec<PriceRecord>,
    pub inserted: u64,
    pub warnings: Vec<PartialDataWarning>,
    pub error: Option<PipelineError>,
}

impl RunReport {
    fn new(run_id: RunId, started_at: DateTime<Tz>) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
            started_at,
            finished_at: None,
            assets_fetched: 0,
            records: Vec::new(),
            inserted: 0,
            warnings: Vec::new(),
            error: None,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal run transition {} -> {}",
            self.state,
            next
        );
        tracing::info!(from = %self.state, to = %next, "run state changed");
        self.state = next;
        self.transitions.push(next);
    }

    fn fail(mut self, error: PipelineError, at: DateTime<Tz>) -> Self {
        tracing::error!(error = %error, "run failed");
        self.transition(RunState::Failed);
        self.finished_at = Some(at);
        self.error = Some(error);
        self
    }

    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    /// `Err` with the failure cause for `FAILED` runs, the report otherwise.
    pub fn into_result(mut self) -> Result<Self, PipelineError> {
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

pub struct Pipeline {
    request: QuoteRequest,
    normalizer: Normalizer,
    source: Arc<dyn QuoteSource>,
    sink: Arc<dyn PriceSink>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        source: Arc<dyn QuoteSource>,
        sink: Arc<dyn PriceSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            request: config.quote_request()?,
            normalizer: config.normalizer()?,
            source,
            sink,
            clock,
        })
    }

    pub fn request(&self) -> &QuoteRequest {
        &self.request
    }

    pub fn zone(&self) -> Tz {
        self.normalizer.zone()
    }

    /// Execute the pipeline once under a fresh run id.
    pub async fn run_once(&self) -> RunReport {
        let run_id = RunId::new();
        let span = tracing::info_span!("etl_run", run_id = %run_id);
        self.execute(run_id).instrument(span).await
    }

    fn now(&self) -> DateTime<Tz> {
        self.normalizer.to_zone(self.clock.now())
    }

    async fn execute(&self, run_id: RunId) -> RunReport {
        let mut report = RunReport::new(run_id, self.now());

        report.transition(RunState::Extracting);
        tracing::info!(
            source = self.source.name(),
            assets = self.request.coins().len(),
            currencies = self.request.currencies().len(),
            "fetching quotes"
        );
        let quotes = match self.source.fetch(&self.request).await {
            Ok(quotes) => quotes,
            Err(e) => {
                tracing::warn!(retry_exhausted = e.is_retry_exhaustion(), "extract step gave up");
                let at = self.now();
                return report.fail(e.into(), at);
            }
        };
        report.assets_fetched = quotes.len();

        report.transition(RunState::Transforming);
        let batch = self
            .normalizer
            .normalize(&self.request, &quotes, run_id, self.clock.now());
        for warning in &batch.warnings {
            tracing::warn!(%warning, "partial data");
        }

        report.transition(RunState::Loading);
        let inserted = match self.sink.persist(&batch.records).await {
            Ok(n) => n,
            Err(e) => {
                let at = self.now();
                report.warnings = batch.warnings;
                return report.fail(e.into(), at);
            }
        };

        tracing::info!(
            records = batch.records.len(),
            inserted,
            duplicates = batch.records.len() as u64 - inserted,
            "load complete"
        );
        match self.sink.total_rows().await {
            Ok(Some(total)) => tracing::info!(total_rows = total, "store row count"),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "could not count stored rows"),
        }

        report.inserted = inserted;
        report.records = batch.records;
        report.warnings = batch.warnings;
        report.finished_at = Some(self.now());
        if report.warnings.is_empty() {
            report.transition(RunState::Succeeded);
        } else {
            report.transition(RunState::CompletedWithWarnings);
        }
        report
    }
}
