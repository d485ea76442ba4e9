//! Data models for PDF Tools.
//!
//! - [`OutputConfig`]: Output organization settings loaded from `output_config.yaml`
//! - [`OperationKind`]: The closed set of transformations (compress, merge, protect, unprotect, watermark)
//! - [`OperationRecord`]: One pipeline invocation with its timing and terminal [`OperationOutcome`]
//! - [`FailureReason`]: Classified cause attached to failed operations
//!
//! # Architecture Note
//!
//! Configuration is owned by [`OutputStore`](crate::services::OutputStore) and handed
//! out as immutable `Arc` snapshots. Records are plain values: the pipeline seals a
//! record once and then clones it to every consumer.

pub mod config;
pub mod operation;

pub use config::{ConfigValidationError, OutputConfig};
pub use operation::{
    FailureReason, OperationId, OperationKind, OperationOutcome, OperationRecord,
    PathResolutionError,
};
