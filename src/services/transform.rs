//! The Document Transform boundary.
//!
//! PDF byte-level work is done by a host-provided [`DocumentTransform`]. The
//! pipeline only needs it to be synchronous from the worker's point of view
//! and to report failure through a [`TransformError`]; library-specific error
//! types are mapped into that enum by the implementation.

use crate::models::OperationKind;
use crate::progress::{NoopSink, ProgressReporter};
use camino::Utf8PathBuf;
use chrono::Local;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Options for stamping a text watermark on every page.
#[derive(Debug, Clone, PartialEq)]
pub struct WatermarkOptions {
    pub text: String,
    pub font_size: u32,
    /// 0.0 (invisible) to 1.0 (opaque)
    pub opacity: f32,
    /// Degrees, counter-clockwise
    pub rotation: i32,
}

impl WatermarkOptions {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            font_size: 40,
            opacity: 0.3,
            rotation: 45,
        }
    }
}

/// Kind-specific parameters. The variant determines the operation kind.
#[derive(Clone, PartialEq)]
pub enum TransformParams {
    Compress,
    Merge,
    Protect { password: String },
    Unprotect { password: String },
    Watermark(WatermarkOptions),
}

impl TransformParams {
    pub fn kind(&self) -> OperationKind {
        match self {
            TransformParams::Compress => OperationKind::Compress,
            TransformParams::Merge => OperationKind::Merge,
            TransformParams::Protect { .. } => OperationKind::Protect,
            TransformParams::Unprotect { .. } => OperationKind::Unprotect,
            TransformParams::Watermark(_) => OperationKind::Watermark,
        }
    }

    /// Check parameter preconditions that do not need the filesystem.
    pub fn validate(&self) -> Result<(), RequestError> {
        match self {
            TransformParams::Protect { password } | TransformParams::Unprotect { password } => {
                if password.trim().is_empty() {
                    return Err(RequestError::EmptyPassword);
                }
            }
            TransformParams::Watermark(options) => {
                if options.text.trim().is_empty() {
                    return Err(RequestError::EmptyWatermarkText);
                }
                if !(0.0..=1.0).contains(&options.opacity) {
                    return Err(RequestError::OpacityOutOfRange(options.opacity));
                }
            }
            TransformParams::Compress | TransformParams::Merge => {}
        }
        Ok(())
    }
}

impl fmt::Debug for TransformParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformParams::Compress => f.write_str("Compress"),
            TransformParams::Merge => f.write_str("Merge"),
            TransformParams::Protect { .. } => f.write_str("Protect { password: <redacted> }"),
            TransformParams::Unprotect { .. } => f.write_str("Unprotect { password: <redacted> }"),
            TransformParams::Watermark(options) => f.debug_tuple("Watermark").field(options).finish(),
        }
    }
}

/// Precondition violations, rejected before any worker is scheduled.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("{kind} requires at least 2 sources, got {got}")]
    NotEnoughSources { kind: OperationKind, got: usize },

    #[error("{kind} takes exactly one source, got {got}")]
    SingleSourceExpected { kind: OperationKind, got: usize },

    #[error("Parameters for {params} do not match requested kind {requested}")]
    KindMismatch {
        requested: OperationKind,
        params: OperationKind,
    },

    #[error("Password cannot be empty")]
    EmptyPassword,

    #[error("Watermark text cannot be empty")]
    EmptyWatermarkText,

    #[error("Watermark opacity must be between 0.0 and 1.0, got {0}")]
    OpacityOutOfRange(f32),
}

/// What the worker hands to the transform.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformRequest {
    pub kind: OperationKind,
    /// Ordered; merge output preserves this order.
    pub sources: Vec<Utf8PathBuf>,
    /// Reserved, directory already exists.
    pub destination: Utf8PathBuf,
    pub params: TransformParams,
}

/// Classified failure reported by a transform implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Malformed or unreadable PDF {path}: {detail}")]
    InvalidInput { path: Utf8PathBuf, detail: String },

    #[error("Wrong password for {path}")]
    WrongPassword { path: Utf8PathBuf },

    #[error("Unsupported content: {0}")]
    Unsupported(String),

    #[error("I/O error on {path}: {message}")]
    Io {
        path: Utf8PathBuf,
        kind: std::io::ErrorKind,
        message: String,
    },

    /// The transform honored a cancellation request and stopped before completing.
    #[error("Stopped after cancellation request")]
    Cancelled,

    #[error("PDF library error: {0}")]
    Library(String),
}

impl TransformError {
    pub fn io(path: impl Into<Utf8PathBuf>, error: &std::io::Error) -> Self {
        TransformError::Io {
            path: path.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Per-invocation context: cooperative cancellation and progress reporting.
#[derive(Debug, Clone)]
pub struct TransformContext {
    cancel_rx: watch::Receiver<bool>,
    progress: ProgressReporter,
}

impl TransformContext {
    pub(crate) fn new(cancel_rx: watch::Receiver<bool>, progress: ProgressReporter) -> Self {
        Self {
            cancel_rx,
            progress,
        }
    }

    /// A context that is never cancelled and reports nowhere.
    ///
    /// For running a transform outside the pipeline.
    pub fn detached() -> Self {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let record = crate::models::OperationRecord::begin(
            OperationKind::Compress,
            Vec::new(),
            Utf8PathBuf::new(),
            Local::now(),
        );
        Self {
            cancel_rx,
            progress: ProgressReporter::new(Arc::new(NoopSink), record),
        }
    }

    /// Whether cancellation has been requested. Transforms should poll this
    /// between units of work and return [`TransformError::Cancelled`] if they stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }
}

/// A PDF transformation backend.
///
/// Invoked on a blocking worker thread; may be slow and may fail.
#[cfg_attr(test, mockall::automock)]
pub trait DocumentTransform: Send + Sync {
    /// Produce the output for `request` and return its final path.
    fn transform(
        &self,
        request: &TransformRequest,
        ctx: &TransformContext,
    ) -> Result<Utf8PathBuf, TransformError>;
}

impl<F> DocumentTransform for F
where
    F: Fn(&TransformRequest, &TransformContext) -> Result<Utf8PathBuf, TransformError> + Send + Sync,
{
    fn transform(
        &self,
        request: &TransformRequest,
        ctx: &TransformContext,
    ) -> Result<Utf8PathBuf, TransformError> {
        self(request, ctx)
    }
}
