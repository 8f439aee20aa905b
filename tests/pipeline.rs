//! Controller and fallback-chain behaviour against scripted backends.
//!
//! No network: every backend here is a `FakeBackend` from `common`.

mod common;

use common::{fast_retry, units, Behaviour, FakeBackend, RecordingSink};
use edgequake_ocr::{
    convert_with_chain, ChainAction, ConcurrencyController, ErrorClass, FallbackChain,
    FallbackPolicy, PageSeparator, PipelineConfig, PipelineError, ProgressEvent, RunStatus,
    UnitError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

fn chain_of(backend: Arc<FakeBackend>, max_attempts: u32) -> Arc<FallbackChain> {
    Arc::new(FallbackChain::default().with_backend(backend, fast_retry(max_attempts)))
}

// ── Ordering and completeness ────────────────────────────────────────────

#[tokio::test]
async fn every_unit_gets_exactly_one_result_in_index_order() {
    let backend = FakeBackend::with_latency("a", Behaviour::Echo, Duration::from_millis(2));
    let agg = assert_ok!(
        ConcurrencyController::new(4)
            .run(units(25), chain_of(backend.clone(), 1))
            .await
    );

    assert_eq!(agg.status, RunStatus::Completed);
    assert_eq!(agg.results.len(), 25);
    let indices: Vec<usize> = agg.results.iter().map(|r| r.index).collect();
    assert_eq!(indices, (0..25).collect::<Vec<_>>());
    assert_eq!(agg.succeeded, 25);
    assert_eq!(agg.not_run, 0);
    assert_eq!(agg.results[7].content, "page-0008");
    assert_eq!(backend.calls(), 25);
}

#[tokio::test]
async fn in_flight_units_never_exceed_limit() {
    for (n, limit) in [(1, 1), (12, 1), (20, 3), (30, 5), (4, 10)] {
        let backend = FakeBackend::with_latency("a", Behaviour::Echo, Duration::from_millis(5));
        let agg = ConcurrencyController::new(limit)
            .run(units(n), chain_of(backend.clone(), 1))
            .await
            .unwrap();
        assert_eq!(agg.results.len(), n);
        assert!(
            backend.peak() <= limit,
            "n={n} limit={limit}: peak {} exceeded the limit",
            backend.peak()
        );
        assert!(backend.peak() >= 1);
    }
}

#[tokio::test]
async fn repeated_runs_produce_identical_ordering() {
    let run = || async {
        // Later units finish first.
        let backend = FakeBackend::with_latency("a", Behaviour::Echo, Duration::from_millis(3));
        let chain = chain_of(backend, 1);
        let agg = ConcurrencyController::new(6).run(units(15), chain).await.unwrap();
        agg.results
            .into_iter()
            .map(|r| (r.index, r.content, r.backend, r.attempts))
            .collect::<Vec<_>>()
    };
    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
}

// ── Retry semantics ──────────────────────────────────────────────────────

#[tokio::test]
async fn server_errors_then_success_counts_attempts() {
    let k = 3;
    let backend = FakeBackend::new(
        "a",
        Behaviour::FailFirst {
            class: ErrorClass::ServerError { status: 502 },
            times: k,
        },
    );
    let agg = ConcurrencyController::new(2)
        .run(units(2), chain_of(backend, 5))
        .await
        .unwrap();
    for result in &agg.results {
        assert!(result.is_success(), "unit {} failed: {:?}", result.index, result.error);
        assert_eq!(result.attempts, k + 1);
        assert_eq!(result.attempt_log.len() as u32, k + 1);
    }
}

#[tokio::test]
async fn client_error_gives_up_after_one_attempt() {
    let backend = FakeBackend::new("a", Behaviour::Always(ErrorClass::ClientError { status: 422 }));
    let agg = ConcurrencyController::new(1)
        .run(units(1), chain_of(backend.clone(), 5))
        .await
        .unwrap();
    let result = &agg.results[0];
    assert_eq!(result.attempts, 1);
    assert_eq!(backend.calls(), 1);
    assert!(matches!(result.error, Some(UnitError::BackendsExhausted { .. })));
}

#[tokio::test]
async fn rate_limit_hint_delays_next_attempt() {
    let backend = FakeBackend::new(
        "a",
        Behaviour::FailFirst {
            class: ErrorClass::RateLimited {
                retry_after: Some(Duration::from_millis(200)),
            },
            times: 1,
        },
    );
    let agg = ConcurrencyController::new(1)
        .run(units(1), chain_of(backend.clone(), 3))
        .await
        .unwrap();
    assert!(agg.results[0].is_success());

    let times = backend.call_times(0);
    assert_eq!(times.len(), 2);
    let gap = times[1].duration_since(times[0]);
    assert!(gap >= Duration::from_millis(200), "gap was {gap:?}");
}

#[tokio::test]
async fn budget_exhaustion_records_failure_without_aborting() {
    let backend = FakeBackend::new("a", Behaviour::Always(ErrorClass::Timeout));
    let agg = ConcurrencyController::new(3)
        .run(units(3), chain_of(backend.clone(), 2))
        .await
        .unwrap();
    assert_eq!(agg.status, RunStatus::Completed);
    assert_eq!(agg.failed, 3);
    assert_eq!(backend.calls(), 6);
    let failure = &agg.results[1].error.as_ref().unwrap().failures()[0];
    assert_eq!(failure.class, ErrorClass::Timeout);
    assert_eq!(failure.attempts, 2);
}

// ── Fallback policy ──────────────────────────────────────────────────────

fn input_error_chain(policy: FallbackPolicy) -> (Arc<FallbackChain>, Arc<FakeBackend>) {
    let a = FakeBackend::new("a", Behaviour::Always(ErrorClass::ClientError { status: 400 }));
    let b = FakeBackend::new("b", Behaviour::Echo);
    let chain = FallbackChain::new(policy)
        .with_backend(a, fast_retry(3))
        .with_backend(b.clone(), fast_retry(3));
    (Arc::new(chain), b)
}

#[tokio::test]
async fn input_error_short_circuits_by_default() {
    let (chain, b) = input_error_chain(FallbackPolicy::default());
    let agg = ConcurrencyController::new(2).run(units(2), chain).await.unwrap();
    assert_eq!(agg.failed, 2);
    assert_eq!(b.calls(), 0);
    match agg.results[0].error {
        Some(UnitError::FallbackStopped { ref backend, .. }) => assert_eq!(backend, "a"),
        ref other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn input_error_falls_through_when_policy_continues() {
    let policy = FallbackPolicy {
        on_input_error: ChainAction::Continue,
        ..FallbackPolicy::default()
    };
    let (chain, b) = input_error_chain(policy);
    let agg = ConcurrencyController::new(2).run(units(2), chain).await.unwrap();
    assert_eq!(agg.succeeded, 2);
    assert_eq!(b.calls(), 2);
    assert_eq!(agg.results[1].backend.as_deref(), Some("b"));
    assert_eq!(agg.results[1].attempts, 2);
}

#[tokio::test]
async fn outage_on_primary_fails_over_to_backup() {
    let a = FakeBackend::new("a", Behaviour::Always(ErrorClass::Connection));
    let b = FakeBackend::new("b", Behaviour::Echo);
    let chain = FallbackChain::default()
        .with_backend(a.clone(), fast_retry(2))
        .with_backend(b, fast_retry(2));
    let agg = ConcurrencyController::new(4).run(units(4), Arc::new(chain)).await.unwrap();
    assert_eq!(agg.succeeded, 4);
    assert!(agg.results.iter().all(|r| r.backend.as_deref() == Some("b")));
    assert_eq!(a.calls(), 8);
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_failing_unit_among_five() {
    let backend = FakeBackend::with_latency(
        "a",
        Behaviour::FailUnit {
            index: 3,
            class: ErrorClass::ClientError { status: 400 },
        },
        Duration::from_millis(3),
    );
    let sink = RecordingSink::new();
    let agg = ConcurrencyController::new(2)
        .with_progress(sink.clone())
        .run(units(5), chain_of(backend, 3))
        .await
        .unwrap();

    assert_eq!(agg.status, RunStatus::Completed);
    assert_eq!(agg.succeeded, 4);
    assert_eq!(agg.failed, 1);
    let failed: Vec<usize> = agg.failures().map(|r| r.index).collect();
    assert_eq!(failed, vec![3]);
    assert_eq!(agg.results[3].content, "");

    let events = sink.events();
    let unit_failed = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::UnitFailed { index: 3, .. }))
        .count();
    assert_eq!(unit_failed, 1);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunFinished {
            status: RunStatus::Completed,
            succeeded: 4,
            failed: 1,
            not_run: 0
        })
    ));
}

#[tokio::test]
async fn cancellation_after_two_dispatches() {
    let token = CancellationToken::new();
    let sink = RecordingSink::cancelling(token.clone(), 2);
    let backend = FakeBackend::with_latency("a", Behaviour::Echo, Duration::from_millis(50));

    let agg = ConcurrencyController::new(2)
        .with_progress(sink.clone())
        .run_with_cancel(units(5), chain_of(backend.clone(), 1), token)
        .await
        .unwrap();

    assert_eq!(agg.status, RunStatus::Cancelled);
    assert!(agg.results.len() <= 2, "got {} results", agg.results.len());
    assert!(agg.results.iter().all(|r| r.index < 2));
    assert_eq!(agg.not_run, 5 - agg.results.len());
    assert!(backend.calls() <= 2);

    let started = sink
        .events()
        .iter()
        .filter(|e| matches!(e, ProgressEvent::UnitStarted { .. }))
        .count();
    assert_eq!(started, 2);
}

#[tokio::test]
async fn grace_period_bounds_cancelled_run() {
    let token = CancellationToken::new();
    let sink = RecordingSink::cancelling(token.clone(), 1);
    let backend = FakeBackend::with_latency("a", Behaviour::Echo, Duration::from_secs(30));

    let started = Instant::now();
    let agg = ConcurrencyController::new(3)
        .with_progress(sink.clone())
        .with_grace_period(Duration::from_millis(50))
        .run_with_cancel(units(3), chain_of(backend, 1), token)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(agg.status, RunStatus::Cancelled);
    assert!(agg.results.is_empty(), "aborted units must not get results");
    assert_eq!(agg.not_run, 3);

    // The aborted unit's start is closed before the run finishes.
    let events = sink.events();
    let aborted: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::UnitAborted { index } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(aborted, vec![0]);
    let n = events.len();
    assert!(matches!(events[n - 2], ProgressEvent::UnitAborted { index: 0 }));
    assert!(matches!(events[n - 1], ProgressEvent::RunFinished { not_run: 3, .. }));
}

#[tokio::test]
async fn mis_indexed_units_are_rejected_before_dispatch() {
    let backend = FakeBackend::new("a", Behaviour::Echo);
    let mut bad = units(3);
    bad.swap(0, 2);
    let err = assert_err!(
        ConcurrencyController::new(2)
            .run(bad, chain_of(backend.clone(), 1))
            .await
    );
    assert!(matches!(err, PipelineError::InvalidUnits(_)));
    assert_eq!(backend.calls(), 0);
}

// ── Document assembly ────────────────────────────────────────────────────

#[tokio::test]
async fn assembled_text_skips_failures_and_cleans_pages() {
    let backend = FakeBackend::new(
        "a",
        Behaviour::FailUnit {
            index: 1,
            class: ErrorClass::ClientError { status: 400 },
        },
    );
    let config = PipelineConfig {
        concurrency: 2,
        page_separator: PageSeparator::Comment,
        ..PipelineConfig::default()
    };
    let output = convert_with_chain(units(3), chain_of(backend, 1), &config)
        .await
        .unwrap();

    assert_eq!(
        output.text,
        "page-0001\n\n<!-- page 3 -->\n\npage-0003\n"
    );
    assert_eq!(output.stats.total_pages, 3);
    assert_eq!(output.stats.processed_pages, 2);
    assert_eq!(output.stats.failed_pages, 1);
    assert_eq!(output.stats.total_input_tokens, 200);
    assert!(matches!(
        output.into_result(),
        Err(PipelineError::PartialFailure { failed: 1, .. })
    ));
}
