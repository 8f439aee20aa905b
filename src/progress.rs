//! Progress sink for per-page lifecycle events.
//!
//! Inject an [`Arc<dyn ProgressSink>`] via
//! [`crate::config::PipelineConfigBuilder::progress`] (or
//! [`crate::controller::ConcurrencyController::with_progress`]) to observe
//! a run as it happens.
//!
//! [`ChannelProgressSink`] forwards events into an unbounded channel and
//! exposes them as a `Stream`.
//!
//! # Contract
//!
//! The controller calls `on_event` inline on its hot path. Implementations
//! must return promptly: buffer internally or forward fire-and-forget, never
//! wait on I/O or locks held across awaits.

use crate::output::RunStatus;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;

/// A lifecycle event emitted by [`crate::controller::ConcurrencyController`].
///
/// Every `UnitStarted` is followed by exactly one of `UnitCompleted`,
/// `UnitFailed` or `UnitAborted` for the same index. Across units, events
/// interleave in completion order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Emitted once, before the first unit is dispatched.
    RunStarted { total_units: usize },
    /// Emitted immediately before a unit is handed to the backend chain.
    UnitStarted {
        index: usize,
        identity: String,
        total_units: usize,
    },
    /// The unit converted successfully.
    UnitCompleted {
        index: usize,
        backend: String,
        attempts: u32,
        content_len: usize,
        elapsed_ms: u64,
    },
    /// The unit reached a terminal failure.
    UnitFailed {
        index: usize,
        attempts: u32,
        error: String,
        elapsed_ms: u64,
    },
    /// The unit was still in flight when the cancellation grace period ran
    /// out. It has no [`crate::output::UnitResult`]; this closes its
    /// `UnitStarted`.
    UnitAborted { index: usize },
    /// Emitted once, after every dispatched unit is terminal or aborted.
    RunFinished {
        status: RunStatus,
        succeeded: usize,
        failed: usize,
        not_run: usize,
    },
}

impl ProgressEvent {
    /// Unit index for unit-scoped events.
    pub fn unit_index(&self) -> Option<usize> {
        match self {
            ProgressEvent::UnitStarted { index, .. }
            | ProgressEvent::UnitCompleted { index, .. }
            | ProgressEvent::UnitFailed { index, .. }
            | ProgressEvent::UnitAborted { index } => Some(*index),
            _ => None,
        }
    }
}

/// Receives lifecycle events from a run.
///
/// Implementations must be `Send + Sync`: events for different units arrive
/// concurrently from different tasks.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Discards every event. The default when no sink is configured.
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// A boxed stream of progress events.
pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

/// Forwards events into an unbounded channel.
///
/// Sending never blocks; if the receiving side was dropped, events are
/// silently discarded.
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    /// Create a sink and the stream that yields its events.
    ///
    /// The stream ends once the sink (and every clone of the `Arc` holding
    /// it) has been dropped.
    pub fn new() -> (Arc<Self>, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = UnboundedReceiverStream::new(rx);
        (Arc::new(Self { tx }), Box::pin(stream))
    }
}

impl ProgressSink for ChannelProgressSink {
    fn on_event(&self, event: &ProgressEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn noop_sink_accepts_everything() {
        let sink: Arc<dyn ProgressSink> = Arc::new(NoopProgressSink);
        sink.on_event(&ProgressEvent::RunStarted { total_units: 3 });
        sink.on_event(&ProgressEvent::RunFinished {
            status: RunStatus::Completed,
            succeeded: 3,
            failed: 0,
            not_run: 0,
        });
    }

    #[tokio::test]
    async fn channel_sink_streams_events_in_send_order() {
        let (sink, mut stream) = ChannelProgressSink::new();
        sink.on_event(&ProgressEvent::RunStarted { total_units: 1 });
        sink.on_event(&ProgressEvent::UnitStarted {
            index: 0,
            identity: "a".into(),
            total_units: 1,
        });
        drop(sink);

        let events: Vec<ProgressEvent> = stream.by_ref().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ProgressEvent::RunStarted { total_units: 1 });
        assert_eq!(events[1].unit_index(), Some(0));
    }

    #[test]
    fn events_serialise_with_tag() {
        let json = serde_json::to_string(&ProgressEvent::RunStarted { total_units: 4 }).unwrap();
        assert_eq!(json, r#"{"event":"run_started","total_units":4}"#);
    }
}
