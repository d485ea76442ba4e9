use crate::models::OperationOutcome;
use crate::services::output_store::StoreError;
use crate::services::path_policy::OUTPUT_EXTENSION;
use crate::services::pipeline::{OperationPipeline, OperationRequest};
use crate::services::transform::{RequestError, TransformParams};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Input directory not found: {path}")]
    InputDirectoryMissing { path: Utf8PathBuf },

    #[error("No PDF files found in {path}")]
    NoPdfFiles { path: Utf8PathBuf },

    #[error("Merge cannot run as a batch; submit one merge request instead")]
    MergeNotSupported,

    #[error("Invalid batch parameters: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("Failed to list {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-item results of one batch run
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    /// `(source, output)` for every successful item, in processing order.
    pub processed: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    /// `(source, reason)` for every failed item.
    pub failed: Vec<(Utf8PathBuf, String)>,
    /// Set when an item was cancelled; remaining items were not started.
    pub cancelled: bool,
    pub output_directory: Utf8PathBuf,
}

impl BatchReport {
    pub fn is_complete_success(&self) -> bool {
        !self.cancelled && self.failed.is_empty() && self.processed.len() == self.total
    }
}

/// Runs one single-source operation over every PDF in a directory.
///
/// Items go through the given pipeline one after another, so the batch
/// competes with other callers of that pipeline like any other operation.
pub struct BatchRunner<'a> {
    pipeline: &'a OperationPipeline,
}

impl<'a> BatchRunner<'a> {
    pub fn new(pipeline: &'a OperationPipeline) -> Self {
        Self { pipeline }
    }

    /// Apply `params` to every `*.pdf` directly inside `input_dir`.
    ///
    /// One item's failure does not stop the batch. A cancelled item does.
    pub async fn run(
        &self,
        input_dir: &Utf8Path,
        params: TransformParams,
    ) -> Result<BatchReport, BatchError> {
        let kind = params.kind();
        if kind.is_multi_source() {
            return Err(BatchError::MergeNotSupported);
        }
        params.validate()?;

        let sources = list_pdf_files(input_dir).await?;
        if sources.is_empty() {
            return Err(BatchError::NoPdfFiles {
                path: input_dir.to_path_buf(),
            });
        }

        let output_directory = self.pipeline.store().batch_directory(kind, Local::now())?;
        tracing::info!(
            "Batch {}: {} files from {} -> {}",
            kind,
            sources.len(),
            input_dir,
            output_directory
        );

        let mut report = BatchReport {
            total: sources.len(),
            processed: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
            output_directory: output_directory.clone(),
        };

        for (index, source) in sources.into_iter().enumerate() {
            tracing::debug!("Batch item {}/{}: {}", index + 1, report.total, source);

            let request = OperationRequest {
                sources: vec![source.clone()],
                params: params.clone(),
                output_dir: Some(output_directory.clone()),
            };
            let handle = match self.pipeline.start(request) {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!("Batch item {} not started: {}", source, e);
                    report.failed.push((source, e.to_string()));
                    continue;
                }
            };

            let record = match handle.wait().await {
                Ok(record) => record,
                Err(e) => {
                    report.failed.push((source, e.to_string()));
                    continue;
                }
            };

            match record.outcome {
                Some(OperationOutcome::Success) => {
                    report.processed.push((source, record.destination));
                }
                Some(OperationOutcome::Cancelled) => {
                    report.failed.push((source, OperationOutcome::Cancelled.summary()));
                    report.cancelled = true;
                    break;
                }
                Some(outcome) => report.failed.push((source, outcome.summary())),
                None => report
                    .failed
                    .push((source, "finished without an outcome".to_string())),
            }
        }

        tracing::info!(
            "Batch {} finished: {}/{} processed, {} failed{}",
            kind,
            report.processed.len(),
            report.total,
            report.failed.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }
}

/// PDF files directly inside `dir`, sorted by path.
async fn list_pdf_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, BatchError> {
    match tokio::fs::metadata(dir).await {
        Ok(metadata) if metadata.is_dir() => {}
        _ => {
            return Err(BatchError::InputDirectoryMissing {
                path: dir.to_path_buf(),
            });
        }
    }

    let io_error = |source| BatchError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let Ok(path) = Utf8PathBuf::try_from(entry.path()) else {
            continue;
        };
        let is_file = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_file())
            .unwrap_or(false);
        let is_pdf = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(OUTPUT_EXTENSION));
        if is_file && is_pdf {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_pdf_files_filters_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        std::fs::write(dir.join("b.pdf"), b"x").unwrap();
        std::fs::write(dir.join("A.PDF"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();
        std::fs::create_dir(dir.join("nested.pdf")).unwrap();

        let files = list_pdf_files(&dir).await.unwrap();
        assert_eq!(files, vec![dir.join("A.PDF"), dir.join("b.pdf")]);
    }

    #[tokio::test]
    async fn test_list_pdf_files_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8PathBuf::try_from(temp_dir.path().join("absent")).unwrap();

        let result = list_pdf_files(&dir).await;
        assert!(matches!(
            result,
            Err(BatchError::InputDirectoryMissing { .. })
        ));
    }
}
