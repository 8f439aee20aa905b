//! Scripted in-process backends shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_ocr::{
    BackendClient, BackendError, BackendOutput, ConversionUnit, ErrorClass, ProgressEvent,
    ProgressSink, RetryConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How a [`FakeBackend`] answers.
#[derive(Clone, Debug)]
pub enum Behaviour {
    /// Return the unit's identity as content.
    Echo,
    /// Fail each unit `times` times with `class`, then echo.
    FailFirst { class: ErrorClass, times: u32 },
    /// Fail every call with `class`.
    Always(ErrorClass),
    /// Fail the unit with this index every time; echo the others.
    FailUnit { index: usize, class: ErrorClass },
}

/// Deterministic backend that records calls and observed concurrency.
pub struct FakeBackend {
    name: String,
    behaviour: Behaviour,
    latency: Duration,
    calls: AtomicU32,
    attempts_by_unit: Mutex<HashMap<usize, u32>>,
    call_times: Mutex<HashMap<usize, Vec<Instant>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeBackend {
    pub fn new(name: &str, behaviour: Behaviour) -> Arc<Self> {
        Self::with_latency(name, behaviour, Duration::ZERO)
    }

    pub fn with_latency(name: &str, behaviour: Behaviour, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behaviour,
            latency,
            calls: AtomicU32::new(0),
            attempts_by_unit: Mutex::new(HashMap::new()),
            call_times: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Call instants recorded for one unit, oldest first.
    pub fn call_times(&self, index: usize) -> Vec<Instant> {
        self.call_times
            .lock()
            .unwrap()
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn convert(&self, unit: &ConversionUnit) -> Result<BackendOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.call_times
            .lock()
            .unwrap()
            .entry(unit.index())
            .or_default()
            .push(Instant::now());
        let attempt = {
            let mut by_unit = self.attempts_by_unit.lock().unwrap();
            let n = by_unit.entry(unit.index()).or_insert(0);
            *n += 1;
            *n
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let fail = match &self.behaviour {
            Behaviour::Echo => None,
            Behaviour::FailFirst { class, times } => (attempt <= *times).then(|| class.clone()),
            Behaviour::Always(class) => Some(class.clone()),
            Behaviour::FailUnit { index, class } => (unit.index() == *index).then(|| class.clone()),
        };
        match fail {
            Some(class) => Err(BackendError::new(class, format!("{} scripted failure", self.name))),
            None => Ok(BackendOutput {
                content: unit.identity().to_string(),
                input_tokens: 100,
                output_tokens: 10,
            }),
        }
    }
}

/// Retries without meaningful waiting.
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 4,
        jitter: false,
    }
}

pub fn units(n: usize) -> Vec<ConversionUnit> {
    ConversionUnit::from_pages((0..n).map(|i| vec![i as u8; 16]))
}

/// Records every event; cancels `token` when the `after`-th unit starts.
pub struct RecordingSink {
    pub events: Mutex<Vec<ProgressEvent>>,
    cancel: Option<(CancellationToken, usize)>,
    started: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            cancel: None,
            started: AtomicUsize::new(0),
        })
    }

    pub fn cancelling(token: CancellationToken, after: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            cancel: Some((token, after)),
            started: AtomicUsize::new(0),
        })
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: &ProgressEvent) {
        self.events.lock().unwrap().push(event.clone());
        if let ProgressEvent::UnitStarted { .. } = event {
            let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((ref token, after)) = self.cancel {
                if n == after {
                    token.cancel();
                }
            }
        }
    }
}
