//! Result types: per-attempt, per-unit, per-run, and the assembled document.

use crate::config::PageSeparator;
use crate::error::{ErrorClass, PipelineError, UnitError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happened on one request to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    /// Backend the attempt was sent to.
    pub backend: String,
    /// 1-based attempt number against this backend.
    pub attempt: u32,
    pub succeeded: bool,
    /// Classification when the attempt failed.
    pub class: Option<ErrorClass>,
    /// Provider retry hint carried by a rate-limit response.
    pub retry_after: Option<Duration>,
    pub elapsed_ms: u64,
}

/// Terminal outcome for one unit.
///
/// Exactly one exists per dispatched unit. `error.is_none()` means success
/// and `content` holds the page text; otherwise `content` is empty and
/// `error` explains which backends were tried and why each gave up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    /// 0-based position of the unit in the document.
    pub index: usize,
    /// Identity token copied from the unit.
    pub identity: String,
    pub content: String,
    /// Backend that produced `content`.
    pub backend: Option<String>,
    /// Attempts across every backend in the chain.
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub attempt_log: Vec<AttemptOutcome>,
    pub error: Option<UnitError>,
}

impl UnitResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// 1-based page number.
    pub fn page_num(&self) -> usize {
        self.index + 1
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every unit reached a terminal state.
    Completed,
    /// Cancellation was requested; undispatched and aborted units have no result.
    Cancelled,
}

/// Ordered collection of unit results for one run.
///
/// For a [`RunStatus::Completed`] run `results.len() == total_units` and the
/// indices are exactly `0..total_units`. A cancelled run only lists the
/// units that reached a terminal state, still in index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub status: RunStatus,
    pub total_units: usize,
    pub results: Vec<UnitResult>,
    pub succeeded: usize,
    pub failed: usize,
    /// Units with no result: never dispatched, or aborted after the grace period.
    pub not_run: usize,
    pub elapsed_ms: u64,
}

impl AggregateResult {
    pub(crate) fn new(
        status: RunStatus,
        total_units: usize,
        results: Vec<UnitResult>,
        elapsed: Duration,
    ) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;
        Self {
            status,
            total_units,
            not_run: total_units - results.len(),
            results,
            succeeded,
            failed,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == RunStatus::Cancelled
    }

    pub fn successes(&self) -> impl Iterator<Item = &UnitResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    /// Look up the result for a unit index.
    pub fn get(&self, index: usize) -> Option<&UnitResult> {
        self.results
            .binary_search_by_key(&index, |r| r.index)
            .ok()
            .map(|pos| &self.results[pos])
    }

    /// Concatenate successful contents in index order.
    ///
    /// The separator is rendered before every page except the first one
    /// emitted; failed pages are skipped without leaving an empty gap.
    pub fn assemble(&self, separator: &PageSeparator) -> String {
        let mut text = String::new();
        for (i, result) in self.successes().enumerate() {
            if i > 0 {
                text.push_str(&separator.render(result.page_num()));
            }
            text.push_str(result.content.trim_end_matches('\n'));
        }
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }
}

/// Aggregate statistics for a conversion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_pages: usize,
    pub processed_pages: usize,
    pub failed_pages: usize,
    /// Pages with no result because the run was cancelled.
    pub skipped_pages: usize,
    pub total_attempts: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
}

impl ConversionStats {
    pub(crate) fn from_aggregate(aggregate: &AggregateResult, total_duration: Duration) -> Self {
        Self {
            total_pages: aggregate.total_units,
            processed_pages: aggregate.succeeded,
            failed_pages: aggregate.failed,
            skipped_pages: aggregate.not_run,
            total_attempts: aggregate.results.iter().map(|r| r.attempts as u64).sum(),
            total_input_tokens: aggregate.results.iter().map(|r| r.input_tokens).sum(),
            total_output_tokens: aggregate.results.iter().map(|r| r.output_tokens).sum(),
            total_duration_ms: total_duration.as_millis() as u64,
        }
    }
}

/// The full result of [`crate::convert::convert_pages`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionOutput {
    /// Successful pages joined in order.
    pub text: String,
    pub aggregate: AggregateResult,
    pub stats: ConversionStats,
}

impl ConversionOutput {
    /// Treat any unit failure (or cancellation) as an error.
    pub fn into_result(self) -> Result<Self, PipelineError> {
        let total = self.aggregate.total_units;
        if total > 0 && self.aggregate.succeeded == 0 {
            let first_error = self
                .aggregate
                .failures()
                .find_map(|r| r.error.as_ref())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "run cancelled before any page finished".to_string());
            return Err(PipelineError::AllUnitsFailed { total, first_error });
        }
        let failed = total - self.aggregate.succeeded;
        if failed > 0 {
            return Err(PipelineError::PartialFailure {
                succeeded: self.aggregate.succeeded,
                failed,
                total,
            });
        }
        Ok(self)
    }
}
