//! Background execution of document operations.
//!
//! An [`OperationPipeline`] runs at most one operation at a time. `start()`
//! never blocks: it validates the request, claims the pipeline and hands the
//! work to the tokio runtime, returning an [`OperationHandle`] that yields the
//! finished [`OperationRecord`] exactly once. Callers needing parallelism
//! create more pipelines.

use crate::metrics::Metrics;
use crate::models::{FailureReason, OperationId, OperationKind, OperationOutcome, OperationRecord};
use crate::progress::{OperationEvent, ProgressReporter, ProgressSink};
use crate::services::output_store::OutputStore;
use crate::services::path_policy;
use crate::services::transform::{
    DocumentTransform, RequestError, TransformContext, TransformError, TransformParams,
    TransformRequest, WatermarkOptions,
};
use crate::state::{PipelineState, StateChange, StateMachine};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use std::fs;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch};

/// What to run: ordered sources plus kind-specific parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub sources: Vec<Utf8PathBuf>,
    pub params: TransformParams,
    /// Write into this directory instead of the policy directory. The file
    /// name still follows the naming policy.
    pub output_dir: Option<Utf8PathBuf>,
}

impl OperationRequest {
    /// Build a request for `kind`, rejecting parameters of another kind.
    pub fn new(
        kind: OperationKind,
        sources: Vec<Utf8PathBuf>,
        params: TransformParams,
    ) -> Result<Self, RequestError> {
        if params.kind() != kind {
            return Err(RequestError::KindMismatch {
                requested: kind,
                params: params.kind(),
            });
        }
        Ok(Self {
            sources,
            params,
            output_dir: None,
        })
    }

    pub fn compress(source: impl Into<Utf8PathBuf>) -> Self {
        Self::single(source, TransformParams::Compress)
    }

    /// Merge `sources` in the given order.
    pub fn merge<I, P>(sources: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            params: TransformParams::Merge,
            output_dir: None,
        }
    }

    pub fn protect(source: impl Into<Utf8PathBuf>, password: impl Into<String>) -> Self {
        Self::single(
            source,
            TransformParams::Protect {
                password: password.into(),
            },
        )
    }

    pub fn unprotect(source: impl Into<Utf8PathBuf>, password: impl Into<String>) -> Self {
        Self::single(
            source,
            TransformParams::Unprotect {
                password: password.into(),
            },
        )
    }

    pub fn watermark(source: impl Into<Utf8PathBuf>, options: WatermarkOptions) -> Self {
        Self::single(source, TransformParams::Watermark(options))
    }

    fn single(source: impl Into<Utf8PathBuf>, params: TransformParams) -> Self {
        Self {
            sources: vec![source.into()],
            params,
            output_dir: None,
        }
    }

    pub fn in_directory(mut self, directory: impl Into<Utf8PathBuf>) -> Self {
        self.output_dir = Some(directory.into());
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.params.kind()
    }

    /// Check source count and parameters. No filesystem access.
    pub fn validate(&self) -> Result<(), RequestError> {
        let kind = self.kind();
        let got = self.sources.len();
        if kind.is_multi_source() {
            if got < 2 {
                return Err(RequestError::NotEnoughSources { kind, got });
            }
        } else if got != 1 {
            return Err(RequestError::SingleSourceExpected { kind, got });
        }
        self.params.validate()
    }

    /// Name the destination is derived from: the first source.
    fn source_name(&self) -> &str {
        self.sources.first().map(|source| source.as_str()).unwrap_or_default()
    }
}

/// Synchronous rejection of a `start()` call. Nothing was scheduled.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StartError {
    #[error("Pipeline is busy with another operation")]
    Busy,

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("Operation still running after {0:?}")]
    DeadlineElapsed(Duration),

    #[error("Worker dropped without reporting an outcome")]
    WorkerLost,

    #[error("Outcome already collected")]
    AlreadyCollected,
}

/// Caller's side of one accepted operation.
#[derive(Debug)]
pub struct OperationHandle {
    record: OperationRecord,
    cancel_tx: Arc<watch::Sender<bool>>,
    done_rx: Option<oneshot::Receiver<OperationRecord>>,
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.record.id
    }

    pub fn kind(&self) -> OperationKind {
        self.record.kind
    }

    /// Destination computed at acceptance. The final path may carry a
    /// collision suffix; read it from the finished record.
    pub fn planned_destination(&self) -> &Utf8Path {
        &self.record.destination
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Wait for the finished record.
    pub async fn wait(mut self) -> Result<OperationRecord, WaitError> {
        let done_rx = self.done_rx.take().ok_or(WaitError::AlreadyCollected)?;
        done_rx.await.map_err(|_| WaitError::WorkerLost)
    }

    /// Wait at most `deadline`.
    ///
    /// On [`WaitError::DeadlineElapsed`] the operation keeps running and the
    /// handle can be waited on again.
    pub async fn wait_timeout(&mut self, deadline: Duration) -> Result<OperationRecord, WaitError> {
        let done_rx = self.done_rx.as_mut().ok_or(WaitError::AlreadyCollected)?;
        let result = tokio::time::timeout(deadline, done_rx).await;
        match result {
            Ok(received) => {
                self.done_rx = None;
                received.map_err(|_| WaitError::WorkerLost)
            }
            Err(_) => Err(WaitError::DeadlineElapsed(deadline)),
        }
    }

    /// Blocking variant of [`wait`](Self::wait) for non-async callers.
    ///
    /// Must not be called from within the runtime.
    pub fn blocking_wait(mut self) -> Result<OperationRecord, WaitError> {
        let done_rx = self.done_rx.take().ok_or(WaitError::AlreadyCollected)?;
        done_rx.blocking_recv().map_err(|_| WaitError::WorkerLost)
    }
}

type CancelSlot = Arc<Mutex<Option<Arc<watch::Sender<bool>>>>>;

/// Runs one document operation at a time on a tokio runtime.
pub struct OperationPipeline {
    store: Arc<OutputStore>,
    transform: Arc<dyn DocumentTransform>,
    sink: Arc<dyn ProgressSink>,
    runtime: Handle,
    state: Arc<StateMachine>,
    metrics: Arc<Metrics>,
    in_flight: CancelSlot,
}

impl OperationPipeline {
    pub fn new(
        store: Arc<OutputStore>,
        transform: Arc<dyn DocumentTransform>,
        sink: Arc<dyn ProgressSink>,
        runtime: Handle,
    ) -> Self {
        Self::with_metrics(store, transform, sink, runtime, Arc::new(Metrics::new()))
    }

    /// Share one metrics instance across several pipelines.
    pub fn with_metrics(
        store: Arc<OutputStore>,
        transform: Arc<dyn DocumentTransform>,
        sink: Arc<dyn ProgressSink>,
        runtime: Handle,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            transform,
            sink,
            runtime,
            state: Arc::new(StateMachine::new()),
            metrics,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Accept `request` and run it in the background.
    ///
    /// Returns [`StartError::Busy`] while another operation is running and
    /// [`StartError::InvalidRequest`] on precondition violations. In both
    /// cases nothing is scheduled and nothing is created on disk.
    pub fn start(&self, request: OperationRequest) -> Result<OperationHandle, StartError> {
        if self.state.current() != PipelineState::Idle {
            return Err(self.reject_busy());
        }
        request.validate()?;
        if !self.state.try_begin() {
            return Err(self.reject_busy());
        }

        let kind = request.kind();
        let config = self.store.configuration();
        let now = Local::now();
        let planned = match &request.output_dir {
            Some(directory) => path_policy::resolve_in(
                directory,
                kind,
                request.source_name(),
                &config,
                now.naive_local(),
            ),
            None => path_policy::resolve(kind, request.source_name(), &config, now.naive_local()),
        };

        let record = OperationRecord::begin(kind, request.sources.clone(), planned, now);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&cancel_tx));
        let (done_tx, done_rx) = oneshot::channel();

        tracing::info!("Accepted {} {} -> {}", kind, record.id, record.destination);

        let worker = Worker {
            store: Arc::clone(&self.store),
            transform: Arc::clone(&self.transform),
            sink: Arc::clone(&self.sink),
            metrics: Arc::clone(&self.metrics),
            seal: Seal {
                state: Arc::clone(&self.state),
                in_flight: Arc::clone(&self.in_flight),
                id: record.id,
                sealed: false,
            },
            record: record.clone(),
            params: request.params,
            cancel_rx,
        };
        self.runtime.spawn(worker.run(done_tx));

        Ok(OperationHandle {
            record,
            cancel_tx,
            done_rx: Some(done_rx),
        })
    }

    /// Convenience over [`start`](Self::start) taking the kind explicitly.
    pub fn start_with(
        &self,
        kind: OperationKind,
        sources: Vec<Utf8PathBuf>,
        params: TransformParams,
    ) -> Result<OperationHandle, StartError> {
        self.start(OperationRequest::new(kind, sources, params)?)
    }

    fn reject_busy(&self) -> StartError {
        self.metrics.record_busy_rejection();
        tracing::debug!("Rejected start: pipeline is {}", self.state.current());
        StartError::Busy
    }

    /// Request cooperative cancellation of the running operation.
    ///
    /// Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match in_flight.as_ref() {
            Some(cancel_tx) => {
                cancel_tx.send_replace(true);
                tracing::info!("Cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.state.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.state.current() != PipelineState::Idle
    }

    pub fn store(&self) -> &Arc<OutputStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// Everything the background task needs, detached from the pipeline.
struct Worker {
    store: Arc<OutputStore>,
    transform: Arc<dyn DocumentTransform>,
    sink: Arc<dyn ProgressSink>,
    metrics: Arc<Metrics>,
    seal: Seal,
    record: OperationRecord,
    params: TransformParams,
    cancel_rx: watch::Receiver<bool>,
}

/// Returns the pipeline to `Idle` once the worker is done with it.
///
/// If the worker future is dropped before finishing (the runtime shut down
/// before or during the operation), the drop closes the operation as failed
/// so the pipeline never stays `Running`.
struct Seal {
    state: Arc<StateMachine>,
    in_flight: CancelSlot,
    id: OperationId,
    sealed: bool,
}

impl Seal {
    fn finish(mut self, succeeded: bool) {
        self.sealed = true;
        self.release(succeeded);
    }

    fn release(&self, succeeded: bool) {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
        if let Err(e) = self.state.finish(succeeded) {
            tracing::error!("{}: {}", self.id, e);
        }
    }
}

impl Drop for Seal {
    fn drop(&mut self) {
        if !self.sealed {
            tracing::warn!("{} worker dropped before completion, marking failed", self.id);
            self.release(false);
        }
    }
}

impl Worker {
    async fn run(self, done_tx: oneshot::Sender<OperationRecord>) {
        let Worker {
            store,
            transform,
            sink,
            metrics,
            seal,
            mut record,
            params,
            cancel_rx,
        } = self;

        metrics.record_operation_started();
        sink.on_event(&OperationEvent::Started {
            kind: record.kind,
            record: record.clone(),
        });

        let reporter = ProgressReporter::new(Arc::clone(&sink), record.clone());
        let job = Job {
            store: Arc::clone(&store),
            transform,
            request: TransformRequest {
                kind: record.kind,
                sources: record.sources.clone(),
                destination: record.destination.clone(),
                params,
            },
            ctx: TransformContext::new(cancel_rx, reporter.clone()),
        };

        let started = Instant::now();
        let (outcome, destination) = match tokio::task::spawn_blocking(move || job.execute()).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("{} worker terminated: {}", record.id, e);
                store.release_reservation(&record.destination);
                (
                    OperationOutcome::Failure(FailureReason::WorkerPanicked(e.to_string())),
                    record.destination.clone(),
                )
            }
        };
        // No progress may follow the terminal event
        reporter.close();
        metrics.record_operation_time(started.elapsed());

        match &outcome {
            OperationOutcome::Success => {
                metrics.record_operation_succeeded();
                tracing::info!("{} {} completed: {}", record.kind, record.id, destination);
            }
            OperationOutcome::Failure(reason) => {
                metrics.record_operation_failed();
                tracing::error!("{} {} {}", record.kind, record.id, outcome.summary());
                tracing::debug!("{} failure detail: {:?}", record.id, reason);
            }
            OperationOutcome::Cancelled => {
                metrics.record_operation_cancelled();
                tracing::info!("{} {} cancelled", record.kind, record.id);
            }
        }

        let succeeded = outcome.is_success();
        record.destination = destination;
        record.finish(outcome.clone(), Local::now());
        sink.on_event(&OperationEvent::Finished {
            record: record.clone(),
            outcome,
        });

        seal.finish(succeeded);

        // The caller may have dropped its handle
        let _ = done_tx.send(record);
    }
}

/// The blocking part of an operation, run on tokio's blocking pool.
struct Job {
    store: Arc<OutputStore>,
    transform: Arc<dyn DocumentTransform>,
    request: TransformRequest,
    ctx: TransformContext,
}

impl Job {
    fn execute(self) -> (OperationOutcome, Utf8PathBuf) {
        let planned = self.request.destination.clone();
        let fail = |reason: FailureReason| (OperationOutcome::Failure(reason), planned.clone());

        if self.ctx.is_cancelled() {
            return (OperationOutcome::Cancelled, planned.clone());
        }

        for source in &self.request.sources {
            match fs::metadata(source) {
                Ok(metadata) if metadata.is_file() => {}
                Ok(_) => {
                    return fail(FailureReason::Filesystem {
                        path: source.clone(),
                        kind: ErrorKind::InvalidInput,
                        message: format!("{} is not a regular file", source),
                    });
                }
                Err(e) => return fail(FailureReason::filesystem(source, &e)),
            }
        }

        if let Some(directory) = planned.parent() {
            if let Err(e) = self.store.ensure_directory(directory) {
                return fail(e.into());
            }
        }
        let destination = match self.store.claim_destination(&planned) {
            Ok(destination) => destination,
            Err(e) => return fail(e.into()),
        };

        if self.ctx.is_cancelled() {
            self.store.release_reservation(&destination);
            return (OperationOutcome::Cancelled, destination);
        }

        let mut request = self.request;
        request.destination = destination.clone();
        tracing::debug!(
            "Invoking transform for {} ({} sources) -> {}",
            request.kind,
            request.sources.len(),
            destination
        );

        match self.transform.transform(&request, &self.ctx) {
            Ok(final_path) => {
                if final_path != destination {
                    self.store.release_reservation(&destination);
                }
                (OperationOutcome::Success, final_path)
            }
            Err(TransformError::Cancelled) => {
                self.store.release_reservation(&destination);
                (OperationOutcome::Cancelled, destination)
            }
            Err(e) => {
                self.store.release_reservation(&destination);
                (
                    OperationOutcome::Failure(FailureReason::Transform(e)),
                    destination,
                )
            }
        }
    }
}
