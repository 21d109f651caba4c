//! Scheduling capability.
//!
//! The coordinator exposes a single-execution entry point; a [`Scheduler`]
//! decides when to call it. Inter-execution retry is nothing more than the
//! next tick.

use crate::pipeline::{RunReport, RunState};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Tally of executions driven by a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleSummary {
    pub runs: u32,
    pub succeeded: u32,
    pub with_warnings: u32,
    pub failed: u32,
}

impl ScheduleSummary {
    pub fn record(&mut self, report: &RunReport) {
        self.runs += 1;
        match report.state {
            RunState::Succeeded => self.succeeded += 1,
            RunState::CompletedWithWarnings => self.with_warnings += 1,
            _ => self.failed += 1,
        }
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Drive `execution` until this scheduler's stop condition holds.
    async fn schedule<F, Fut>(&self, execution: F) -> ScheduleSummary
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = RunReport> + Send;
}

/// Invokes the execution exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOnce;

#[async_trait]
impl Scheduler for RunOnce {
    async fn schedule<F, Fut>(&self, mut execution: F) -> ScheduleSummary
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = RunReport> + Send,
    {
        let mut summary = ScheduleSummary::default();
        summary.record(&execution().await);
        summary
    }
}

/// Fixed-cadence scheduler.
///
/// The first execution starts immediately. Ticks missed while an execution
/// was still running are skipped, so a slow run never causes a burst, and
/// executions never overlap. Stops when `true` is sent on the shutdown
/// channel, when its sender is dropped, or after `max_runs`.
#[derive(Debug, Clone)]
pub struct IntervalScheduler {
    interval: Duration,
    max_runs: Option<u32>,
    shutdown: watch::Receiver<bool>,
}

impl IntervalScheduler {
    pub fn new(interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            interval,
            max_runs: None,
            shutdown,
        }
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl Scheduler for IntervalScheduler {
    async fn schedule<F, Fut>(&self, mut execution: F) -> ScheduleSummary
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = RunReport> + Send,
    {
        let mut summary = ScheduleSummary::default();
        if self.max_runs == Some(0) {
            return summary;
        }

        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            max_runs = ?self.max_runs,
            "scheduler started"
        );

        loop {
            let stop_requested = *shutdown.borrow();
            if stop_requested {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tracing::debug!("shutdown sender dropped");
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let report = execution().await;
            summary.record(&report);
            tracing::info!(
                run = summary.runs,
                run_id = %report.run_id,
                state = %report.state,
                "scheduled run finished"
            );

            if self.max_runs.is_some_and(|max| summary.runs >= max) {
                break;
            }
        }

        tracing::info!(
            runs = summary.runs,
            succeeded = summary.succeeded,
            with_warnings = summary.with_warnings,
            failed = summary.failed,
            "scheduler stopped"
        );
        summary
    }
}
