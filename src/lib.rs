// pdftools - background PDF operations and output organization
//
// This is the library crate containing the pipeline, the output store and
// the data structures they share. The binary crate (main.rs) provides a
// headless maintenance CLI over the output store.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod progress;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::{ConfigManager, ConfigWarning, LoadedConfig};
pub use metrics::Metrics;
pub use models::{
    FailureReason, OperationId, OperationKind, OperationOutcome, OperationRecord, OutputConfig,
    PathResolutionError,
};
pub use progress::{BroadcastSink, NoopSink, OperationEvent, ProgressSink, TracingSink};
pub use services::{
    DocumentTransform, OperationHandle, OperationPipeline, OperationRequest, OutputStore,
    StartError, TransformError, TransformParams,
};
pub use state::{PipelineState, StateChange};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
