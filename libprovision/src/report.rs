//! Aggregation of [`CommandResult`]s into an [`ExecutionReport`].
//!
//! A [`Reporter`] is the append-only ledger for one run. Calling
//! [`Reporter::finalize`] consumes it, so a report can only be produced once
//! and never changes afterwards.

use std::time::Duration;

use derive_getters::Getters;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::executor::CommandResult;
use crate::log::*;
use crate::plan::secs;

#[derive(Getters, Debug, Clone, Serialize)]
pub struct ReportEntry {
    batch: String,
    /// Index of the command within its batch.
    position: usize,
    result: CommandResult,
}

#[derive(Getters, Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    total: usize,
    succeeded: usize,
    failed: usize,
    /// Sum of the time spent in each command, retries included.
    #[serde(with = "secs")]
    command_time: Duration,
}

impl Summary {
    fn count(&mut self, result: &CommandResult) {
        self.total += 1;
        if result.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.command_time += *result.elapsed();
    }
}

#[derive(Getters, Debug, Clone, Serialize)]
pub struct ExecutionReport {
    #[serde(with = "time::serde::rfc3339")]
    started_at: OffsetDateTime,
    #[serde(with = "secs")]
    wall_time: Duration,
    #[getter(skip)]
    aborted: bool,
    /// Set when the run could not proceed at all, e.g. the host never
    /// accepted a connection.
    error: Option<String>,
    summary: Summary,
    entries: Vec<ReportEntry>,
}

impl ExecutionReport {
    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn results(&self) -> impl Iterator<Item = &CommandResult> {
        self.entries.iter().map(|entry| &entry.result)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|entry| !entry.result.is_success())
    }

    /// Nothing failed, nothing was skipped, and nothing went wrong outside a
    /// command.
    pub fn is_success(&self) -> bool {
        !self.aborted && self.error.is_none() && self.summary.failed == 0
    }
}

#[derive(Debug)]
pub struct Reporter {
    started_at: OffsetDateTime,
    clock: Instant,
    aborted: bool,
    error: Option<String>,
    summary: Summary,
    entries: Vec<ReportEntry>,
}

impl Reporter {
    pub fn new() -> Self {
        Self {
            started_at: OffsetDateTime::now_utc(),
            clock: Instant::now(),
            aborted: false,
            error: None,
            summary: Summary::default(),
            entries: vec![],
        }
    }

    pub fn record<S: Into<String>>(&mut self, batch: S, position: usize, result: CommandResult) {
        let batch = batch.into();
        trace!(
            "reporter: {}[{}] '{}' -> {}",
            batch,
            position,
            result.command(),
            result.exit_status()
        );
        self.summary.count(&result);
        self.entries.push(ReportEntry {
            batch,
            position,
            result,
        });
    }

    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    /// Note a failure that is not tied to any one command. Only the first
    /// error is kept.
    pub fn record_error<S: Into<String>>(&mut self, error: S) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
    }

    /// Fold a finished report, typically one batch, into this one.
    pub fn absorb(&mut self, report: ExecutionReport) {
        for entry in report.entries {
            self.record(entry.batch, entry.position, entry.result);
        }
        if report.aborted {
            self.mark_aborted();
        }
        if let Some(error) = report.error {
            self.record_error(error);
        }
    }

    pub fn finalize(self) -> ExecutionReport {
        ExecutionReport {
            started_at: self.started_at,
            wall_time: self.clock.elapsed(),
            aborted: self.aborted,
            error: self.error,
            summary: self.summary,
            entries: self.entries,
        }
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}
