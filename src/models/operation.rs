use crate::services::transform::TransformError;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// The transformation class applied to a document.
///
/// The set is closed: every kind has a filename suffix and an output folder,
/// and both are the same lowercase past-tense word (`compressed`, `merged`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Compress,
    Merge,
    Protect,
    Unprotect,
    Watermark,
}

impl OperationKind {
    /// All kinds in declaration order.
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Compress,
        OperationKind::Merge,
        OperationKind::Protect,
        OperationKind::Unprotect,
        OperationKind::Watermark,
    ];

    /// Suffix appended to output file stems (`report_compressed.pdf`).
    pub fn suffix(self) -> &'static str {
        match self {
            OperationKind::Compress => "compressed",
            OperationKind::Merge => "merged",
            OperationKind::Protect => "protected",
            OperationKind::Unprotect => "unprotected",
            OperationKind::Watermark => "watermarked",
        }
    }

    /// Folder name used under the output root when subdirectories are enabled.
    pub fn folder(self) -> &'static str {
        self.suffix()
    }

    /// Map an output folder (or suffix token) back to its kind.
    pub fn from_folder(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.folder() == name)
    }

    /// Whether this kind consumes an ordered sequence of sources.
    pub fn is_multi_source(self) -> bool {
        matches!(self, OperationKind::Merge)
    }

    /// Attribute an artifact to a kind from its path relative to the output root.
    ///
    /// The first path component wins when it is a kind folder; otherwise the
    /// right-most `_<suffix>` token of the file stem is used.
    pub fn classify(relative: &Utf8Path) -> Option<Self> {
        let mut components = relative.components();
        let first = components.next()?;
        if components.next().is_some() {
            if let Some(kind) = Self::from_folder(first.as_str()) {
                return Some(kind);
            }
        }

        let stem = relative.file_stem()?;
        stem.rsplit('_').find_map(Self::from_folder)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationKind::Compress => "Compress",
            OperationKind::Merge => "Merge",
            OperationKind::Protect => "Protect",
            OperationKind::Unprotect => "Unprotect",
            OperationKind::Watermark => "Watermark",
        };
        f.write_str(label)
    }
}

/// Raised when an operation kind cannot be resolved.
///
/// This always indicates an integration error upstream and is never coerced
/// into a default kind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathResolutionError {
    #[error("Unknown operation kind: '{0}'")]
    UnknownKind(String),
}

impl FromStr for OperationKind {
    type Err = PathResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compress" | "compressed" => Ok(OperationKind::Compress),
            "merge" | "merged" => Ok(OperationKind::Merge),
            "protect" | "protected" => Ok(OperationKind::Protect),
            "unprotect" | "unprotected" => Ok(OperationKind::Unprotect),
            "watermark" | "watermarked" => Ok(OperationKind::Watermark),
            _ => Err(PathResolutionError::UnknownKind(s.to_string())),
        }
    }
}

/// Process-unique identifier of one pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(u64);

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

impl OperationId {
    pub fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Classified cause of a failed operation.
///
/// The original cause is kept as data so the record stays cloneable and can
/// be handed to any number of sinks.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("Filesystem error at {path}: {message}")]
    Filesystem {
        path: Utf8PathBuf,
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("Transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("Worker terminated unexpectedly: {0}")]
    WorkerPanicked(String),
}

impl FailureReason {
    pub fn filesystem(path: impl Into<Utf8PathBuf>, error: &std::io::Error) -> Self {
        FailureReason::Filesystem {
            path: path.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Short human-readable class of the failure
    pub fn classification(&self) -> &'static str {
        match self {
            FailureReason::Filesystem { .. } => "filesystem error",
            FailureReason::Transform(_) => "transform error",
            FailureReason::WorkerPanicked(_) => "internal error",
        }
    }
}

/// Terminal outcome of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Success,
    Failure(FailureReason),
    Cancelled,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success)
    }

    /// Classification plus original cause, suitable for a status line.
    pub fn summary(&self) -> String {
        match self {
            OperationOutcome::Success => "completed".to_string(),
            OperationOutcome::Cancelled => "cancelled".to_string(),
            OperationOutcome::Failure(reason) => {
                format!("failed ({}): {}", reason.classification(), reason)
            }
        }
    }
}

/// One invocation of the pipeline, from acceptance to terminal outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
    pub id: OperationId,
    pub kind: OperationKind,
    pub sources: Vec<Utf8PathBuf>,
    /// Planned destination until the operation finishes, then the final path.
    pub destination: Utf8PathBuf,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub outcome: Option<OperationOutcome>,
}

impl OperationRecord {
    pub fn begin(
        kind: OperationKind,
        sources: Vec<Utf8PathBuf>,
        destination: Utf8PathBuf,
        started_at: DateTime<Local>,
    ) -> Self {
        Self {
            id: OperationId::next(),
            kind,
            sources,
            destination,
            started_at,
            finished_at: None,
            outcome: None,
        }
    }

    /// Seal the record with its outcome. Called exactly once by the pipeline.
    pub fn finish(&mut self, outcome: OperationOutcome, finished_at: DateTime<Local>) {
        self.outcome = Some(outcome);
        self.finished_at = Some(finished_at);
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Wall-clock duration, once finished.
    pub fn duration(&self) -> Option<Duration> {
        let finished = self.finished_at?;
        (finished - self.started_at).to_std().ok()
    }
}
