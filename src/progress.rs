//! Progress sinks for operation lifecycle events.
//!
//! The pipeline reports to exactly one [`ProgressSink`]. For a single operation
//! events arrive strictly ordered: `Started`, any number of `Progress`, then
//! one `Finished`. Nothing is ordered across pipeline instances.

use crate::models::{OperationKind, OperationOutcome, OperationRecord};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Lifecycle event for one operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    Started {
        kind: OperationKind,
        record: OperationRecord,
    },

    /// Best-effort; a transform may never emit one. `percent` is `None` for
    /// activity without a measurable fraction.
    Progress {
        record: OperationRecord,
        percent: Option<u8>,
    },

    Finished {
        record: OperationRecord,
        outcome: OperationOutcome,
    },
}

impl OperationEvent {
    pub fn record(&self) -> &OperationRecord {
        match self {
            OperationEvent::Started { record, .. }
            | OperationEvent::Progress { record, .. }
            | OperationEvent::Finished { record, .. } => record,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationEvent::Finished { .. })
    }
}

/// Consumer of operation events: a UI widget, a log, or a test recorder.
///
/// Called from worker threads, so implementations must be `Send + Sync` and
/// should return quickly. `Started` and `Finished` are delivered inline on a
/// tokio runtime thread and `Progress` on the blocking pool thread running the
/// transform; a sink that does slow or blocking work stalls that thread and
/// should hand events off (for example through [`BroadcastSink`]).
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &OperationEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&OperationEvent) + Send + Sync,
{
    fn on_event(&self, event: &OperationEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn on_event(&self, _event: &OperationEvent) {}
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_event(&self, event: &OperationEvent) {
        match event {
            OperationEvent::Started { kind, record } => {
                tracing::info!("{} {} started -> {}", kind, record.id, record.destination);
            }
            OperationEvent::Progress { record, percent } => match percent {
                Some(p) => tracing::debug!("{} progress {}%", record.id, p),
                None => tracing::debug!("{} working", record.id),
            },
            OperationEvent::Finished { record, outcome } => {
                if outcome.is_success() {
                    tracing::info!("{} finished: {}", record.id, record.destination);
                } else {
                    tracing::warn!("{} {}", record.id, outcome.summary());
                }
            }
        }
    }
}

/// Fans events out to any number of async subscribers.
///
/// Slow subscribers lag and lose the oldest events rather than blocking the worker.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<OperationEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ProgressSink for BroadcastSink {
    fn on_event(&self, event: &OperationEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

/// Handle given to a transform for intermediate progress.
///
/// Closed by the pipeline once the transform returns, after which reports are
/// dropped so nothing can arrive after the terminal event.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    record: OperationRecord,
    open: Arc<AtomicBool>,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, record: OperationRecord) -> Self {
        Self {
            sink,
            record,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Report completion percentage, clamped to 100.
    pub fn report(&self, percent: u8) {
        self.emit(Some(percent.min(100)));
    }

    /// Report activity without a measurable fraction.
    pub fn report_activity(&self) {
        self.emit(None);
    }

    fn emit(&self, percent: Option<u8>) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        self.sink.on_event(&OperationEvent::Progress {
            record: self.record.clone(),
            percent,
        });
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("operation", &self.record.id)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use chrono::Local;
    use std::sync::Mutex;

    fn sample_record() -> OperationRecord {
        OperationRecord::begin(
            OperationKind::Compress,
            vec![Utf8PathBuf::from("a.pdf")],
            Utf8PathBuf::from("out/a_compressed.pdf"),
            Local::now(),
        )
    }

    #[test]
    fn test_reporter_clamps_and_closes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |event: &OperationEvent| {
            if let OperationEvent::Progress { percent, .. } = event {
                seen_clone.lock().unwrap().push(*percent);
            }
        });

        let reporter = ProgressReporter::new(sink, sample_record());
        reporter.report(40);
        reporter.report(250);
        reporter.report_activity();
        reporter.close();
        reporter.report(90);

        assert_eq!(*seen.lock().unwrap(), vec![Some(40), Some(100), None]);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::default();
        let mut rx = sink.subscribe();

        let record = sample_record();
        sink.on_event(&OperationEvent::Started {
            kind: record.kind,
            record: record.clone(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.record().id, record.id);
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let sink = BroadcastSink::new(4);
        let record = sample_record();
        sink.on_event(&OperationEvent::Finished {
            record,
            outcome: OperationOutcome::Success,
        });
    }
}
