//! Services module - output organization and background document operations.
//!
//! The services are **framework-agnostic**: no UI code and no PDF library.
//! Byte-level PDF work is supplied by the host through [`DocumentTransform`].
//!
//! # Components
//!
//! - [`path_policy`]: pure destination naming and directory partitioning
//! - [`OutputStore`]: owns the output root and its configuration; directory
//!   materialization, destination reservation, statistics, cleanup sweeps and
//!   inventory export
//! - [`OperationPipeline`]: runs one operation at a time on a tokio runtime
//!   and reports lifecycle events to a progress sink
//! - [`BatchRunner`]: feeds every PDF of a directory through one pipeline
//!
//! # Usage Example
//!
//! ```ignore
//! use pdftools::services::{OperationPipeline, OperationRequest, OutputStore};
//!
//! let store = Arc::new(OutputStore::open(ConfigManager::new("pdftools-data")?));
//! let pipeline = OperationPipeline::new(store, transform, Arc::new(TracingSink), handle);
//!
//! let op = pipeline.start(OperationRequest::compress("report.pdf"))?;
//! let record = op.wait().await?;
//! ```

pub mod batch;
pub mod output_store;
pub mod path_policy;
pub mod pipeline;
pub mod transform;

pub use batch::{BatchError, BatchReport, BatchRunner};
pub use output_store::{
    CleanupFailure, CleanupOptions, CleanupReport, CrowdedDirectory, INVENTORY_FILE_NAME,
    Inventory, InventoryEntry, KindStatistics, OutputStatistics, OutputStore, StoreError,
    UsageBucket,
};
pub use pipeline::{OperationHandle, OperationPipeline, OperationRequest, StartError, WaitError};
pub use transform::{
    DocumentTransform, RequestError, TransformContext, TransformError, TransformParams,
    TransformRequest, WatermarkOptions,
};
