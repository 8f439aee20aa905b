//! Ordered fallback across backends, each with its own retry loop.
//!
//! ## Flow for one unit
//!
//! ```text
//! backend[0] ──attempt──▶ fail ──decide──▶ Retry(d): sleep d, attempt again
//!                                     └──▶ GiveUp ──blame──▶ Transient  → next backend
//!                                                        ├──▶ Input     → policy.on_input_error
//!                                                        └──▶ Provider  → policy.on_provider_error
//! ```
//!
//! The first success wins. Running out of backends (or a `Stop` action)
//! yields a [`ChainFailure`] carrying every backend's last error.

use crate::backend::{BackendClient, BackendOutput, BackendRegistry};
use crate::config::{ChainAction, ChainConfig, FallbackPolicy, RetryConfig};
use crate::error::{BackendError, BackendFailure, Blame, PipelineError, UnitError};
use crate::output::AttemptOutcome;
use crate::retry::{Decision, RetryPolicy};
use crate::unit::ConversionUnit;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// One backend plus the patience the chain shows it.
#[derive(Clone)]
pub struct ChainEntry {
    backend: Arc<dyn BackendClient>,
    retry: RetryPolicy,
    attempt_timeout: Option<Duration>,
}

impl ChainEntry {
    /// Default retry policy, no per-attempt deadline.
    pub fn new(backend: Arc<dyn BackendClient>) -> Self {
        Self {
            backend,
            retry: RetryPolicy::default(),
            attempt_timeout: None,
        }
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    /// Abandon a single attempt after `limit`; the attempt counts as a
    /// [`crate::error::ErrorClass::Timeout`].
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }
}

/// A unit converted by one of the chain's backends.
#[derive(Debug, Clone)]
pub struct ChainSuccess {
    pub backend: String,
    pub output: BackendOutput,
    /// Every attempt made for this unit, failed ones included.
    pub attempts: Vec<AttemptOutcome>,
}

/// Every backend gave up on a unit, or a `Stop` action cut the chain short.
#[derive(Debug, Clone)]
pub struct ChainFailure {
    /// Last error of each backend that was tried, in chain order.
    pub failures: Vec<BackendFailure>,
    /// Backend whose failure stopped the chain while others remained untried.
    pub stopped_at: Option<String>,
    pub attempts: Vec<AttemptOutcome>,
}

impl ChainFailure {
    pub fn into_unit_error(self, index: usize) -> UnitError {
        match self.stopped_at {
            Some(backend) => UnitError::FallbackStopped {
                index,
                backend,
                failures: self.failures,
            },
            None => UnitError::BackendsExhausted {
                index,
                failures: self.failures,
            },
        }
    }
}

/// Backends in priority order plus the short-circuit policy.
#[derive(Clone, Default)]
pub struct FallbackChain {
    entries: Vec<ChainEntry>,
    policy: FallbackPolicy,
}

impl FallbackChain {
    pub fn new(policy: FallbackPolicy) -> Self {
        Self {
            entries: Vec::new(),
            policy,
        }
    }

    /// Append a backend with the lowest priority so far.
    pub fn with_entry(mut self, entry: ChainEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Shorthand for `with_entry(ChainEntry::new(backend).with_retry(retry))`.
    pub fn with_backend(self, backend: Arc<dyn BackendClient>, retry: RetryConfig) -> Self {
        self.with_entry(ChainEntry::new(backend).with_retry(retry))
    }

    /// Chain the named backends in `order`, each with the default retry
    /// policy and no per-attempt deadline.
    pub fn from_registry<S: AsRef<str>>(
        registry: &BackendRegistry,
        order: &[S],
        policy: FallbackPolicy,
    ) -> Result<Self, PipelineError> {
        let mut out = Self::new(policy);
        for name in order {
            let name = name.as_ref();
            let backend = registry
                .get(name)
                .ok_or_else(|| PipelineError::UnknownBackend {
                    name: name.to_string(),
                    known: registry.names().join(", "),
                })?;
            out.entries.push(ChainEntry::new(backend));
        }
        if out.entries.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "fallback chain has no backends".into(),
            ));
        }
        Ok(out)
    }

    /// Assemble the chain from registered backends, following
    /// [`ChainConfig::resolved_order`], with each backend's own retry budget
    /// and timeout. Backends left out of an explicit `order` are not part of
    /// the chain.
    pub fn from_config(registry: &BackendRegistry, chain: &ChainConfig) -> Result<Self, PipelineError> {
        let mut out = Self::from_registry(registry, &chain.resolved_order()[..], chain.policy)?;
        for entry in out.entries.iter_mut() {
            if let Some(cfg) = chain.backends.iter().find(|b| b.name == entry.name()) {
                entry.retry = RetryPolicy::new(cfg.retry.clone());
                entry.attempt_timeout = Some(cfg.timeout());
            }
        }
        debug!("Fallback chain: {}", out.names().join(" → "));
        Ok(out)
    }

    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(ChainEntry::name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert one unit, walking the chain until a backend succeeds.
    pub async fn convert(&self, unit: &ConversionUnit) -> Result<ChainSuccess, ChainFailure> {
        let mut failures = Vec::new();
        let mut log = Vec::new();

        for (pos, entry) in self.entries.iter().enumerate() {
            let failure = match self.drive(entry, unit, &mut log).await {
                Ok(output) => {
                    return Ok(ChainSuccess {
                        backend: entry.name().to_string(),
                        output,
                        attempts: log,
                    })
                }
                Err(failure) => failure,
            };

            let action = match failure.class.blame() {
                Blame::Transient => ChainAction::Continue,
                Blame::Input => self.policy.on_input_error,
                Blame::Provider => self.policy.on_provider_error,
            };
            let next = self.entries.get(pos + 1).map(ChainEntry::name);
            let name = failure.backend.clone();
            failures.push(failure);

            match (action, next) {
                (_, None) => break,
                (ChainAction::Stop, Some(_)) => {
                    warn!(
                        "Page {}: '{}' failed non-retryably, not trying remaining backends",
                        unit.page_num(),
                        name
                    );
                    return Err(ChainFailure {
                        failures,
                        stopped_at: Some(name),
                        attempts: log,
                    });
                }
                (ChainAction::Continue, Some(next)) => {
                    info!(
                        "Page {}: falling back from '{}' to '{}'",
                        unit.page_num(),
                        name,
                        next
                    );
                }
            }
        }

        Err(ChainFailure {
            failures,
            stopped_at: None,
            attempts: log,
        })
    }

    /// Retry loop against a single backend.
    async fn drive(
        &self,
        entry: &ChainEntry,
        unit: &ConversionUnit,
        log: &mut Vec<AttemptOutcome>,
    ) -> Result<BackendOutput, BackendFailure> {
        let max_attempts = entry.retry.config().max_attempts;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = attempt_once(entry, unit).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let err = match result {
                Ok(output) => {
                    log.push(AttemptOutcome {
                        backend: entry.name().to_string(),
                        attempt,
                        succeeded: true,
                        class: None,
                        retry_after: None,
                        elapsed_ms,
                    });
                    return Ok(output);
                }
                Err(err) => err,
            };

            log.push(AttemptOutcome {
                backend: entry.name().to_string(),
                attempt,
                succeeded: false,
                class: Some(err.class.clone()),
                retry_after: err.class.retry_after(),
                elapsed_ms,
            });

            match entry.retry.decide(&err.class, attempt) {
                Decision::Retry(delay) => {
                    warn!(
                        "Page {}: '{}' attempt {}/{} failed ({}), retrying in {}ms",
                        unit.page_num(),
                        entry.name(),
                        attempt,
                        max_attempts,
                        err,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
                Decision::GiveUp => {
                    warn!(
                        "Page {}: '{}' gave up after {} attempt(s): {}",
                        unit.page_num(),
                        entry.name(),
                        attempt,
                        err
                    );
                    return Err(BackendFailure {
                        backend: entry.name().to_string(),
                        attempts: attempt,
                        class: err.class,
                        message: err.message,
                    });
                }
            }
        }
    }
}

async fn attempt_once(entry: &ChainEntry, unit: &ConversionUnit) -> Result<BackendOutput, BackendError> {
    match entry.attempt_timeout {
        Some(limit) => timeout(limit, entry.backend.convert(unit))
            .await
            .unwrap_or_else(|_| {
                Err(BackendError::timeout(format!(
                    "no response within {}ms",
                    limit.as_millis()
                )))
            }),
        None => entry.backend.convert(unit).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed script of outcomes, then repeats the last one.
    struct Scripted {
        name: &'static str,
        script: Mutex<VecDeque<Result<&'static str, ErrorClass>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(name: &'static str, script: Vec<Result<&'static str, ErrorClass>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendClient for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn convert(&self, _unit: &ConversionUnit) -> Result<BackendOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    script.front().cloned().unwrap()
                }
            };
            next.map(BackendOutput::text)
                .map_err(|class| BackendError::new(class, "scripted"))
        }
    }

    struct Stalled;

    #[async_trait]
    impl BackendClient for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn convert(&self, _unit: &ConversionUnit) -> Result<BackendOutput, BackendError> {
            sleep(Duration::from_secs(30)).await;
            Ok(BackendOutput::text("late"))
        }
    }

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        }
    }

    fn unit() -> ConversionUnit {
        ConversionUnit::new(0, vec![0u8; 8], "page-0001")
    }

    const SERVER: ErrorClass = ErrorClass::ServerError { status: 503 };
    const BAD_INPUT: ErrorClass = ErrorClass::ClientError { status: 400 };
    const UNAUTHORIZED: ErrorClass = ErrorClass::ClientError { status: 401 };

    #[tokio::test]
    async fn recovers_after_transient_errors() {
        let a = Scripted::new("a", vec![Err(SERVER), Err(SERVER), Ok("text")]);
        let chain = FallbackChain::default().with_backend(a.clone(), fast(5));
        let ok = chain.convert(&unit()).await.expect("third attempt succeeds");
        assert_eq!(ok.backend, "a");
        assert_eq!(ok.output.content, "text");
        assert_eq!(ok.attempts.len(), 3);
        assert!(ok.attempts[2].succeeded);
        assert_eq!(a.calls(), 3);
    }

    #[tokio::test]
    async fn client_error_is_tried_once() {
        let a = Scripted::new("a", vec![Err(BAD_INPUT)]);
        let chain = FallbackChain::default().with_backend(a.clone(), fast(5));
        let err = chain.convert(&unit()).await.unwrap_err();
        assert_eq!(a.calls(), 1);
        assert_eq!(err.failures[0].attempts, 1);
        assert!(matches!(err.into_unit_error(0), UnitError::BackendsExhausted { .. }));
    }

    #[tokio::test]
    async fn input_error_stops_chain_by_default() {
        let a = Scripted::new("a", vec![Err(BAD_INPUT)]);
        let b = Scripted::new("b", vec![Ok("from b")]);
        let chain = FallbackChain::default()
            .with_backend(a, fast(3))
            .with_backend(b.clone(), fast(3));
        let err = chain.convert(&unit()).await.unwrap_err();
        assert_eq!(err.stopped_at.as_deref(), Some("a"));
        assert_eq!(b.calls(), 0);
        assert!(matches!(
            err.into_unit_error(4),
            UnitError::FallbackStopped { index: 4, .. }
        ));
    }

    #[tokio::test]
    async fn input_error_continues_when_configured() {
        let policy = FallbackPolicy {
            on_input_error: ChainAction::Continue,
            ..FallbackPolicy::default()
        };
        let a = Scripted::new("a", vec![Err(BAD_INPUT)]);
        let b = Scripted::new("b", vec![Ok("from b")]);
        let chain = FallbackChain::new(policy)
            .with_backend(a, fast(3))
            .with_backend(b, fast(3));
        let ok = chain.convert(&unit()).await.expect("b succeeds");
        assert_eq!(ok.backend, "b");
        assert_eq!(ok.attempts.len(), 2);
    }

    #[tokio::test]
    async fn provider_error_stops_unless_configured() {
        let a = Scripted::new("a", vec![Err(UNAUTHORIZED)]);
        let b = Scripted::new("b", vec![Ok("from b")]);
        let stop = FallbackChain::default()
            .with_backend(a.clone(), fast(3))
            .with_backend(b.clone(), fast(3));
        assert!(stop.convert(&unit()).await.is_err());

        let go_on = FallbackChain::new(FallbackPolicy::exhaustive())
            .with_backend(a, fast(3))
            .with_backend(b, fast(3));
        assert_eq!(go_on.convert(&unit()).await.unwrap().backend, "b");
    }

    #[tokio::test]
    async fn transient_exhaustion_always_falls_back() {
        let a = Scripted::new("a", vec![Err(SERVER)]);
        let b = Scripted::new("b", vec![Ok("from b")]);
        let chain = FallbackChain::default()
            .with_backend(a.clone(), fast(2))
            .with_backend(b, fast(2));
        let ok = chain.convert(&unit()).await.unwrap();
        assert_eq!(ok.backend, "b");
        assert_eq!(a.calls(), 2);
        assert_eq!(ok.attempts.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_backend() {
        let a = Scripted::new("a", vec![Err(ErrorClass::Timeout)]);
        let b = Scripted::new("b", vec![Err(SERVER)]);
        let chain = FallbackChain::default()
            .with_backend(a, fast(2))
            .with_backend(b, fast(3));
        let err = chain.convert(&unit()).await.unwrap_err();
        assert_eq!(err.stopped_at, None);
        let names: Vec<_> = err.failures.iter().map(|f| f.backend.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(err.failures[1].attempts, 3);
        assert_eq!(err.attempts.len(), 5);
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let chain = FallbackChain::default().with_entry(
            ChainEntry::new(Arc::new(Stalled))
                .with_retry(fast(1))
                .with_attempt_timeout(Duration::from_millis(30)),
        );
        let err = chain.convert(&unit()).await.unwrap_err();
        assert_eq!(err.failures[0].class, ErrorClass::Timeout);
    }

    #[tokio::test]
    async fn rate_limit_hint_is_honoured() {
        let limited = ErrorClass::RateLimited {
            retry_after: Some(Duration::from_millis(200)),
        };
        let a = Scripted::new("a", vec![Err(limited), Ok("text")]);
        let chain = FallbackChain::default().with_backend(a, fast(3));
        let started = Instant::now();
        let ok = chain.convert(&unit()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(ok.attempts[0].retry_after, Some(Duration::from_millis(200)));
    }

    #[test]
    fn from_config_follows_order() {
        let mut registry = BackendRegistry::new();
        registry.register(Scripted::new("a", vec![Ok("x")])).unwrap();
        registry.register(Scripted::new("b", vec![Ok("y")])).unwrap();
        let chain_config = ChainConfig {
            order: vec!["b".into(), "a".into()],
            ..ChainConfig::default()
        };
        let chain = FallbackChain::from_config(&registry, &chain_config).unwrap();
        assert_eq!(chain.names(), vec!["b", "a"]);

        let missing = ChainConfig {
            order: vec!["c".into()],
            ..ChainConfig::default()
        };
        assert!(matches!(
            FallbackChain::from_config(&registry, &missing),
            Err(PipelineError::UnknownBackend { .. })
        ));
    }

    #[test]
    fn from_registry_rejects_empty_order() {
        let mut registry = BackendRegistry::new();
        registry.register(Scripted::new("a", vec![Ok("x")])).unwrap();
        let empty: [&str; 0] = [];
        assert!(matches!(
            FallbackChain::from_registry(&registry, &empty[..], FallbackPolicy::default()),
            Err(PipelineError::InvalidConfig(_))
        ));
        let chain =
            FallbackChain::from_registry(&registry, &["a"][..], FallbackPolicy::exhaustive()).unwrap();
        assert_eq!(chain.names(), vec!["a"]);
        assert_eq!(chain.policy(), FallbackPolicy::exhaustive());
    }
}
