//! Bounded-parallel driver: every unit through the fallback chain, results
//! in index order.
//!
//! ## Per-unit lifecycle
//!
//! ```text
//! Pending ──permit──▶ InFlight ──chain──▶ Succeeded
//!                                   └───▶ Failed
//! ```
//!
//! Retries and fallbacks happen inside [`FallbackChain::convert`] and are not
//! controller states. A unit is dispatched only after it holds one of
//! `max_concurrency` semaphore permits; the permit travels with the task and
//! is released when the task ends, successful or not.
//!
//! ## Isolation
//!
//! A failed chain becomes [`UnitResult::error`]. A panic inside a backend is
//! caught at the task boundary and recorded as [`UnitError::Panicked`], so no
//! unit can take the run down with it.
//!
//! ## Cancellation
//!
//! Once the token fires, no further unit is dispatched. Units already in
//! flight get `grace_period` to finish (retries included); whatever is still
//! running then is aborted, gets no result and is reported to the progress
//! sink as `UnitAborted`. The run reports [`RunStatus::Cancelled`].

use crate::config::PipelineConfig;
use crate::error::{PipelineError, UnitError};
use crate::fallback::FallbackChain;
use crate::output::{AggregateResult, RunStatus, UnitResult};
use crate::progress::{NoopProgressSink, ProgressEvent, ProgressSink};
use crate::unit::ConversionUnit;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drives a run of units through a [`FallbackChain`].
#[derive(Clone)]
pub struct ConcurrencyController {
    max_concurrency: usize,
    grace_period: Duration,
    progress: Arc<dyn ProgressSink>,
}

impl ConcurrencyController {
    /// At least one unit is always allowed in flight.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            grace_period: Duration::from_secs(5),
            progress: Arc::new(NoopProgressSink),
        }
    }

    /// Concurrency, grace period and sink from a pipeline config.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let controller = Self::new(config.concurrency).with_grace_period(config.grace_period());
        match config.progress {
            Some(ref sink) => controller.with_progress(Arc::clone(sink)),
            None => controller,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run every unit to a terminal state.
    pub async fn run(
        &self,
        units: Vec<ConversionUnit>,
        chain: Arc<FallbackChain>,
    ) -> Result<AggregateResult, PipelineError> {
        self.run_with_cancel(units, chain, CancellationToken::new())
            .await
    }

    /// Run every unit to a terminal state, or until `cancel` fires.
    ///
    /// Errors only when the run cannot start: the units are not indexed
    /// `0..N` in order, or the chain is empty. Unit failures are data.
    pub async fn run_with_cancel(
        &self,
        units: Vec<ConversionUnit>,
        chain: Arc<FallbackChain>,
        cancel: CancellationToken,
    ) -> Result<AggregateResult, PipelineError> {
        validate_units(&units)?;
        if chain.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "fallback chain has no backends".into(),
            ));
        }

        let total = units.len();
        let started = Instant::now();
        info!(
            "Converting {} page(s), up to {} in flight, chain: {}",
            total,
            self.max_concurrency,
            chain.names().join(" → ")
        );
        self.emit(&ProgressEvent::RunStarted { total_units: total });

        let gate = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks: JoinSet<(usize, UnitResult)> = JoinSet::new();
        let mut slots: Vec<Option<UnitResult>> = (0..total).map(|_| None).collect();
        let mut cancel_seen = false;
        let mut dispatched = 0usize;

        // ── Dispatch ─────────────────────────────────────────────────────
        for unit in units {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancel_seen = true;
                    break;
                }
                permit = Arc::clone(&gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Admission gate closed unexpectedly: {e}");
                        break;
                    }
                },
            };

            self.emit(&ProgressEvent::UnitStarted {
                index: unit.index(),
                identity: unit.identity().to_string(),
                total_units: total,
            });
            debug!("Page {}: dispatched ({})", unit.page_num(), unit.identity());
            dispatched += 1;

            let chain = Arc::clone(&chain);
            let sink = Arc::clone(&self.progress);
            tasks.spawn(async move {
                let _permit = permit;
                let result = process_unit(&chain, &unit).await;
                notify(sink.as_ref(), &terminal_event(&result));
                (unit.index(), result)
            });
        }

        // ── Drain ────────────────────────────────────────────────────────
        let mut deadline = cancel_seen.then(|| Instant::now() + self.grace_period);
        if cancel_seen {
            info!(
                "Cancellation requested; waiting up to {:?} for {} in-flight page(s)",
                self.grace_period,
                tasks.len()
            );
        }
        loop {
            let joined = match deadline {
                Some(at) => match timeout_at(at, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            "Grace period elapsed; aborting {} in-flight page(s)",
                            tasks.len()
                        );
                        tasks.abort_all();
                        while let Some(joined) = tasks.join_next().await {
                            if let Ok((index, result)) = joined {
                                record(&mut slots, index, result);
                            }
                        }
                        break;
                    }
                },
                None => tokio::select! {
                    joined = tasks.join_next() => joined,
                    _ = cancel.cancelled() => {
                        cancel_seen = true;
                        deadline = Some(Instant::now() + self.grace_period);
                        info!(
                            "Cancellation requested; waiting up to {:?} for {} in-flight page(s)",
                            self.grace_period,
                            tasks.len()
                        );
                        continue;
                    }
                },
            };

            match joined {
                None => break,
                Some(Ok((index, result))) => record(&mut slots, index, result),
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => error!("Page task ended outside isolation: {e}"),
            }
        }

        let status = if cancel_seen {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        if cancel_seen {
            for index in (0..dispatched).filter(|&i| slots[i].is_none()) {
                self.emit(&ProgressEvent::UnitAborted { index });
            }
        }
        let results: Vec<UnitResult> = slots.into_iter().flatten().collect();
        if status == RunStatus::Completed && results.len() != total {
            return Err(PipelineError::Internal(format!(
                "{} of {} pages finished without a result",
                total - results.len(),
                total
            )));
        }

        let aggregate = AggregateResult::new(status, total, results, started.elapsed());
        info!(
            "Run {:?}: {} succeeded, {} failed, {} not run in {}ms",
            aggregate.status,
            aggregate.succeeded,
            aggregate.failed,
            aggregate.not_run,
            aggregate.elapsed_ms
        );
        self.emit(&ProgressEvent::RunFinished {
            status: aggregate.status,
            succeeded: aggregate.succeeded,
            failed: aggregate.failed,
            not_run: aggregate.not_run,
        });
        Ok(aggregate)
    }

    fn emit(&self, event: &ProgressEvent) {
        notify(self.progress.as_ref(), event);
    }
}

/// Deliver one event; a panicking sink loses the event, never the run.
fn notify(sink: &dyn ProgressSink, event: &ProgressEvent) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| sink.on_event(event))) {
        error!(
            "Progress sink panicked on {:?}: {}",
            event,
            panic_message(panic.as_ref())
        );
    }
}

/// Units must arrive as indices `0..N`, in order.
fn validate_units(units: &[ConversionUnit]) -> Result<(), PipelineError> {
    for (position, unit) in units.iter().enumerate() {
        if unit.index() != position {
            return Err(PipelineError::InvalidUnits(format!(
                "unit at position {position} has index {}; expected indices 0..{} in order",
                unit.index(),
                units.len()
            )));
        }
    }
    Ok(())
}

/// Set-once write into the slot for `index`.
fn record(slots: &mut [Option<UnitResult>], index: usize, result: UnitResult) {
    match slots.get_mut(index) {
        Some(slot) if slot.is_none() => *slot = Some(result),
        Some(_) => error!("Page {}: duplicate result ignored", index + 1),
        None => error!("Result for unknown unit index {index} ignored"),
    }
}

async fn process_unit(chain: &FallbackChain, unit: &ConversionUnit) -> UnitResult {
    let started = Instant::now();
    let outcome = AssertUnwindSafe(chain.convert(unit)).catch_unwind().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut result = UnitResult {
        index: unit.index(),
        identity: unit.identity().to_string(),
        content: String::new(),
        backend: None,
        attempts: 0,
        elapsed_ms,
        input_tokens: 0,
        output_tokens: 0,
        attempt_log: Vec::new(),
        error: None,
    };

    match outcome {
        Ok(Ok(success)) => {
            result.content = success.output.content;
            result.backend = Some(success.backend);
            result.attempts = success.attempts.len() as u32;
            result.input_tokens = success.output.input_tokens;
            result.output_tokens = success.output.output_tokens;
            result.attempt_log = success.attempts;
        }
        Ok(Err(failure)) => {
            result.attempts = failure.attempts.len() as u32;
            result.attempt_log = failure.attempts.clone();
            result.error = Some(failure.into_unit_error(unit.index()));
        }
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("Page {}: conversion panicked: {}", unit.page_num(), detail);
            result.error = Some(UnitError::Panicked {
                index: unit.index(),
                detail,
            });
        }
    }
    result
}

fn terminal_event(result: &UnitResult) -> ProgressEvent {
    match (&result.error, &result.backend) {
        (None, Some(backend)) => ProgressEvent::UnitCompleted {
            index: result.index,
            backend: backend.clone(),
            attempts: result.attempts,
            content_len: result.content.len(),
            elapsed_ms: result.elapsed_ms,
        },
        (error, _) => ProgressEvent::UnitFailed {
            index: result.index,
            attempts: result.attempts,
            error: error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no backend produced a result".into()),
            elapsed_ms: result.elapsed_ms,
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
