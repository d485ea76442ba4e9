//! Integration tests for OperationPipeline and BatchRunner
//!
//! These tests verify:
//! - Busy rejection while an operation is running
//! - Precondition rejection before any worker is scheduled
//! - Event ordering delivered to the progress sink
//! - Cooperative cancellation, honored and ignored
//! - Collision suffixing, deadlines and batch runs

use camino::{Utf8Path, Utf8PathBuf};
use pdftools::services::{
    BatchError, BatchRunner, RequestError, TransformContext, TransformRequest, WaitError,
};
use pdftools::{
    ConfigManager, DocumentTransform, FailureReason, NoopSink, OperationEvent, OperationKind,
    OperationOutcome, OperationPipeline, OperationRequest, OutputConfig, OutputStore,
    PipelineState, ProgressSink, StartError, StateChange, TransformError, TransformParams,
};
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TestEnv {
    _temp_dir: TempDir,
    root: Utf8PathBuf,
    store: Arc<OutputStore>,
}

impl TestEnv {
    fn new() -> Self {
        Self::with_config(OutputConfig::default())
    }

    fn with_config(config: OutputConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        let manager = ConfigManager::new(root.join("config")).unwrap();
        let config = OutputConfig {
            base_output_dir: root.join("output"),
            ..config
        };
        Self {
            _temp_dir: temp_dir,
            root: root.clone(),
            store: Arc::new(OutputStore::with_config(manager, config)),
        }
    }

    /// Write a small fake PDF under `<root>/input`.
    fn source(&self, name: &str) -> Utf8PathBuf {
        let dir = self.root.join("input");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, format!("%PDF-1.7 {}", name)).unwrap();
        path
    }

    fn pipeline(
        &self,
        transform: Arc<dyn DocumentTransform>,
        sink: Arc<dyn ProgressSink>,
    ) -> OperationPipeline {
        OperationPipeline::new(Arc::clone(&self.store), transform, sink, Handle::current())
    }
}

/// Concatenate the sources into the destination.
fn write_output(request: &TransformRequest) -> Result<Utf8PathBuf, TransformError> {
    let mut bytes = Vec::new();
    for source in &request.sources {
        bytes.extend(fs::read(source).map_err(|e| TransformError::io(source, &e))?);
    }
    fs::write(&request.destination, bytes)
        .map_err(|e| TransformError::io(&request.destination, &e))?;
    Ok(request.destination.clone())
}

fn copy_transform() -> Arc<dyn DocumentTransform> {
    Arc::new(
        |request: &TransformRequest, _ctx: &TransformContext| -> Result<Utf8PathBuf, TransformError> {
            write_output(request)
        },
    )
}

/// Transform that announces it started, then waits for the gate.
fn gated_transform() -> (
    Arc<dyn DocumentTransform>,
    tokio::sync::mpsc::UnboundedReceiver<()>,
    mpsc::Sender<()>,
) {
    let (started_tx, started_rx) = tokio::sync::mpsc::unbounded_channel();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);
    let transform = move |request: &TransformRequest,
                          _ctx: &TransformContext|
          -> Result<Utf8PathBuf, TransformError> {
        let _ = started_tx.send(());
        let _ = gate_rx.lock().unwrap().recv();
        write_output(request)
    };
    (Arc::new(transform), started_rx, gate_tx)
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<OperationEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<OperationEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: &OperationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn outcome_of(record: &pdftools::OperationRecord) -> &OperationOutcome {
    record.outcome.as_ref().expect("finished record has an outcome")
}

#[tokio::test]
async fn test_start_while_running_is_busy() {
    let env = TestEnv::new();
    let (transform, mut started_rx, gate_tx) = gated_transform();
    let pipeline = env.pipeline(transform, Arc::new(NoopSink));

    let first = pipeline.start(OperationRequest::compress(env.source("a.pdf"))).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);
    timeout(TEST_TIMEOUT, started_rx.recv()).await.unwrap();

    let second = pipeline.start(OperationRequest::compress(env.source("b.pdf")));
    assert_eq!(second.unwrap_err(), StartError::Busy);
    let third = pipeline.start(OperationRequest::merge(["x.pdf"]));
    assert_eq!(third.unwrap_err(), StartError::Busy);

    gate_tx.send(()).unwrap();
    let record = timeout(TEST_TIMEOUT, first.wait()).await.unwrap().unwrap();

    assert_eq!(outcome_of(&record), &OperationOutcome::Success);
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(pipeline.metrics().busy_rejections.load(Ordering::Relaxed), 2);
    assert_eq!(pipeline.metrics().operations_started.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_single_source_merge_rejected_before_dispatch() {
    let env = TestEnv::new();
    let sink = Arc::new(RecordingSink::default());
    let pipeline = env.pipeline(copy_transform(), sink.clone());

    let result = pipeline.start(OperationRequest::merge([env.source("only.pdf")]));

    assert_eq!(
        result.unwrap_err(),
        StartError::InvalidRequest(RequestError::NotEnoughSources {
            kind: OperationKind::Merge,
            got: 1
        })
    );
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert!(!env.store.base_dir().exists());
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn test_invalid_params_rejected() {
    let env = TestEnv::new();
    let pipeline = env.pipeline(copy_transform(), Arc::new(NoopSink));

    let result = pipeline.start(OperationRequest::protect(env.source("a.pdf"), ""));
    assert_eq!(
        result.unwrap_err(),
        StartError::InvalidRequest(RequestError::EmptyPassword)
    );

    let result = pipeline.start_with(
        OperationKind::Watermark,
        vec![env.source("a.pdf")],
        TransformParams::Compress,
    );
    assert!(matches!(
        result,
        Err(StartError::InvalidRequest(RequestError::KindMismatch { .. }))
    ));
    assert!(!env.store.base_dir().exists());
}

#[tokio::test]
async fn test_events_are_ordered() {
    let env = TestEnv::new();
    let sink = Arc::new(RecordingSink::default());
    let transform = |request: &TransformRequest,
                     ctx: &TransformContext|
     -> Result<Utf8PathBuf, TransformError> {
        for percent in [10, 50, 100] {
            ctx.progress().report(percent);
        }
        write_output(request)
    };
    let pipeline = env.pipeline(Arc::new(transform), sink.clone());

    let handle = pipeline
        .start(OperationRequest::watermark(
            env.source("report.pdf"),
            pdftools::services::WatermarkOptions::new("DRAFT"),
        ))
        .unwrap();
    let id = handle.id();
    let record = timeout(TEST_TIMEOUT, handle.wait()).await.unwrap().unwrap();

    let events = sink.events();
    assert_eq!(events.len(), 5);
    assert!(matches!(
        &events[0],
        OperationEvent::Started {
            kind: OperationKind::Watermark,
            ..
        }
    ));
    let percents: Vec<Option<u8>> = events[1..4]
        .iter()
        .map(|event| match event {
            OperationEvent::Progress { percent, .. } => *percent,
            other => panic!("expected progress, got {:?}", other),
        })
        .collect();
    assert_eq!(percents, vec![Some(10), Some(50), Some(100)]);
    match &events[4] {
        OperationEvent::Finished { record: finished, outcome } => {
            assert_eq!(outcome, &OperationOutcome::Success);
            assert_eq!(finished, &record);
        }
        other => panic!("expected finished, got {:?}", other),
    }
    assert!(events.iter().all(|event| event.record().id == id));

    assert!(record.destination.exists());
    assert!(record.duration().is_some());
}

#[tokio::test]
async fn test_honored_cancellation() {
    let env = TestEnv::new();
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let transform = move |_request: &TransformRequest,
                          ctx: &TransformContext|
          -> Result<Utf8PathBuf, TransformError> {
        let _ = started_tx.send(());
        while !ctx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(TransformError::Cancelled)
    };
    let pipeline = env.pipeline(Arc::new(transform), Arc::new(NoopSink));
    let mut changes = pipeline.subscribe_state();

    let handle = pipeline.start(OperationRequest::compress(env.source("big.pdf"))).unwrap();
    timeout(TEST_TIMEOUT, started_rx.recv()).await.unwrap();
    assert!(pipeline.cancel());

    let record = timeout(TEST_TIMEOUT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(outcome_of(&record), &OperationOutcome::Cancelled);
    // The empty reservation does not outlive the operation
    assert!(!record.destination.exists());
    assert_eq!(pipeline.state(), PipelineState::Idle);

    let seen: Vec<StateChange> = std::iter::from_fn(|| changes.try_recv().ok()).collect();
    let targets: Vec<PipelineState> = seen.iter().map(|change| change.to).collect();
    assert_eq!(
        targets,
        vec![
            PipelineState::Running,
            PipelineState::Failed,
            PipelineState::Idle
        ]
    );
}

#[tokio::test]
async fn test_ignored_cancellation_completes_normally() {
    let env = TestEnv::new();
    let (transform, mut started_rx, gate_tx) = gated_transform();
    let pipeline = env.pipeline(transform, Arc::new(NoopSink));

    let handle = pipeline.start(OperationRequest::compress(env.source("a.pdf"))).unwrap();
    timeout(TEST_TIMEOUT, started_rx.recv()).await.unwrap();
    handle.cancel();
    gate_tx.send(()).unwrap();

    let record = timeout(TEST_TIMEOUT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(outcome_of(&record), &OperationOutcome::Success);
    assert!(record.destination.exists());
}

#[tokio::test]
async fn test_transform_failure_keeps_cause() {
    let env = TestEnv::new();
    let transform = |request: &TransformRequest,
                     _ctx: &TransformContext|
     -> Result<Utf8PathBuf, TransformError> {
        Err(TransformError::WrongPassword {
            path: request.sources[0].clone(),
        })
    };
    let pipeline = env.pipeline(Arc::new(transform), Arc::new(NoopSink));
    let source = env.source("locked.pdf");

    let handle = pipeline
        .start(OperationRequest::unprotect(&source, "guess"))
        .unwrap();
    let record = timeout(TEST_TIMEOUT, handle.wait()).await.unwrap().unwrap();

    let outcome = outcome_of(&record);
    assert_eq!(
        outcome,
        &OperationOutcome::Failure(FailureReason::Transform(TransformError::WrongPassword {
            path: source
        }))
    );
    assert!(outcome.summary().starts_with("failed (transform error)"));
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(pipeline.metrics().operations_failed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_missing_source_is_filesystem_failure() {
    let env = TestEnv::new();
    let pipeline = env.pipeline(copy_transform(), Arc::new(NoopSink));

    let handle = pipeline
        .start(OperationRequest::merge([
            env.source("present.pdf"),
            env.root.join("input/absent.pdf"),
        ]))
        .unwrap();
    let record = timeout(TEST_TIMEOUT, handle.wait()).await.unwrap().unwrap();

    match outcome_of(&record) {
        OperationOutcome::Failure(reason @ FailureReason::Filesystem { path, .. }) => {
            assert!(path.ends_with("absent.pdf"));
            assert_eq!(reason.classification(), "filesystem error");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!env.store.base_dir().exists());
}

#[tokio::test]
async fn test_merge_preserves_source_order() {
    let env = TestEnv::new();
    let pipeline = env.pipeline(copy_transform(), Arc::new(NoopSink));
    let sources = vec![env.source("c.pdf"), env.source("a.pdf"), env.source("b.pdf")];

    let handle = pipeline.start(OperationRequest::merge(sources.clone())).unwrap();
    let record = timeout(TEST_TIMEOUT, handle.wait()).await.unwrap().unwrap();

    assert_eq!(record.sources, sources);
    let merged = fs::read_to_string(&record.destination).unwrap();
    assert_eq!(merged, "%PDF-1.7 c.pdf%PDF-1.7 a.pdf%PDF-1.7 b.pdf");
    assert!(record
        .destination
        .starts_with(env.store.base_dir().join("merged")));
    assert!(record.destination.file_name().unwrap().starts_with("c_merged_"));
}

#[tokio::test]
async fn test_name_collision_gets_numeric_suffix() {
    let env = TestEnv::with_config(OutputConfig {
        add_timestamp: false,
        ..OutputConfig::default()
    });
    let pipeline = env.pipeline(copy_transform(), Arc::new(NoopSink));
    let source = env.source("report.pdf");

    let mut destinations = Vec::new();
    for _ in 0..3 {
        let handle = pipeline.start(OperationRequest::compress(&source)).unwrap();
        let record = timeout(TEST_TIMEOUT, handle.wait()).await.unwrap().unwrap();
        assert!(outcome_of(&record).is_success());
        destinations.push(record.destination);
    }

    let names: Vec<&str> = destinations
        .iter()
        .map(|path| path.file_name().unwrap())
        .collect();
    assert_eq!(
        names,
        vec![
            "report_compressed.pdf",
            "report_compressed_(1).pdf",
            "report_compressed_(2).pdf"
        ]
    );
}

#[tokio::test]
async fn test_wait_timeout_leaves_operation_running() {
    let env = TestEnv::new();
    let (transform, mut started_rx, gate_tx) = gated_transform();
    let pipeline = env.pipeline(transform, Arc::new(NoopSink));

    let mut handle = pipeline.start(OperationRequest::compress(env.source("a.pdf"))).unwrap();
    timeout(TEST_TIMEOUT, started_rx.recv()).await.unwrap();

    let early = handle.wait_timeout(Duration::from_millis(20)).await;
    assert_eq!(
        early.unwrap_err(),
        WaitError::DeadlineElapsed(Duration::from_millis(20))
    );
    assert_eq!(pipeline.state(), PipelineState::Running);

    gate_tx.send(()).unwrap();
    let record = handle.wait_timeout(TEST_TIMEOUT).await.unwrap();
    assert!(outcome_of(&record).is_success());

    assert_eq!(
        handle.wait_timeout(TEST_TIMEOUT).await.unwrap_err(),
        WaitError::AlreadyCollected
    );
}

#[tokio::test]
async fn test_independent_pipelines_run_in_parallel() {
    let env = TestEnv::new();
    let first = env.pipeline(copy_transform(), Arc::new(NoopSink));
    let second = env.pipeline(copy_transform(), Arc::new(NoopSink));

    let a = first.start(OperationRequest::compress(env.source("a.pdf"))).unwrap();
    let b = second.start(OperationRequest::compress(env.source("b.pdf"))).unwrap();
    assert!(first.is_busy() && second.is_busy());

    let (a, b) = tokio::join!(a.wait(), b.wait());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(outcome_of(&a).is_success() && outcome_of(&b).is_success());
    assert_ne!(a.destination, b.destination);
}

#[tokio::test]
async fn test_batch_run_continues_after_failure() {
    let env = TestEnv::new();
    let transform = |request: &TransformRequest,
                     _ctx: &TransformContext|
     -> Result<Utf8PathBuf, TransformError> {
        let source = &request.sources[0];
        if source.file_name().is_some_and(|name| name.starts_with("bad")) {
            return Err(TransformError::InvalidInput {
                path: source.clone(),
                detail: "truncated".to_string(),
            });
        }
        write_output(request)
    };
    let pipeline = env.pipeline(Arc::new(transform), Arc::new(NoopSink));
    for name in ["a.pdf", "bad.pdf", "c.PDF"] {
        env.source(name);
    }
    env.source("notes.txt");

    let input = env.root.join("input");
    let report = timeout(
        TEST_TIMEOUT,
        BatchRunner::new(&pipeline).run(&input, TransformParams::Compress),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.processed.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].0.ends_with("bad.pdf"));
    assert!(report.failed[0].1.contains("truncated"));
    assert!(!report.is_complete_success());

    assert!(report
        .output_directory
        .file_name()
        .unwrap()
        .starts_with("batch_"));
    for (_, output) in &report.processed {
        assert_eq!(output.parent(), Some(report.output_directory.as_path()));
        assert!(output.exists());
    }
}

fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn test_batch_rejections() {
    let runtime = build_runtime();
    let env = TestEnv::new();
    let pipeline = OperationPipeline::new(
        Arc::clone(&env.store),
        copy_transform(),
        Arc::new(NoopSink),
        runtime.handle().clone(),
    );
    let runner = BatchRunner::new(&pipeline);
    let empty = env.root.join("empty");
    fs::create_dir_all(&empty).unwrap();

    let merge = tokio_test::block_on(runner.run(&empty, TransformParams::Merge));
    assert!(matches!(merge, Err(BatchError::MergeNotSupported)));

    let none = tokio_test::block_on(runner.run(&empty, TransformParams::Compress));
    assert!(matches!(none, Err(BatchError::NoPdfFiles { .. })));

    let missing = tokio_test::block_on(
        runner.run(Utf8Path::new("/nonexistent/input"), TransformParams::Compress),
    );
    assert!(matches!(
        missing,
        Err(BatchError::InputDirectoryMissing { .. })
    ));
    assert!(!env.store.base_dir().exists());
}

#[test]
fn test_blocking_wait_from_plain_thread() {
    let runtime = build_runtime();
    let env = TestEnv::new();
    let pipeline = OperationPipeline::new(
        Arc::clone(&env.store),
        copy_transform(),
        Arc::new(NoopSink),
        runtime.handle().clone(),
    );

    let handle = pipeline
        .start(OperationRequest::protect(env.source("a.pdf"), "s3cret"))
        .unwrap();
    let record = handle.blocking_wait().unwrap();

    assert!(outcome_of(&record).is_success());
    assert!(record
        .destination
        .starts_with(env.store.base_dir().join("protected")));
    assert_eq!(pipeline.state(), PipelineState::Idle);
}

#[test]
fn test_pipeline_recovers_when_runtime_is_gone() {
    let runtime = build_runtime();
    let handle = runtime.handle().clone();
    drop(runtime);

    let env = TestEnv::new();
    let pipeline = OperationPipeline::new(
        Arc::clone(&env.store),
        copy_transform(),
        Arc::new(NoopSink),
        handle,
    );
    let mut changes = pipeline.subscribe_state();

    let operation = pipeline
        .start(OperationRequest::compress(env.source("a.pdf")))
        .unwrap();
    assert!(matches!(operation.blocking_wait(), Err(WaitError::WorkerLost)));

    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert!(!pipeline.cancel());
    let seen: Vec<PipelineState> = std::iter::from_fn(|| changes.try_recv().ok())
        .map(|change: StateChange| change.to)
        .collect();
    assert_eq!(
        seen,
        vec![
            PipelineState::Running,
            PipelineState::Failed,
            PipelineState::Idle
        ]
    );

    // The next start is accepted instead of being rejected as Busy
    let next = pipeline.start(OperationRequest::compress(env.source("b.pdf")));
    assert!(next.is_ok());
}
