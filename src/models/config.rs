use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Output organization settings, persisted as `output_config.yaml`.
///
/// Missing keys fall back to their defaults and unknown keys are ignored, so
/// files written by older or newer versions still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root of all generated artifacts; created lazily.
    pub base_output_dir: Utf8PathBuf,

    /// Age in days after which artifacts are removed by cleanup. 0 disables it.
    pub auto_cleanup_days: u32,

    /// Partition outputs as `<root>/<kind>/<YYYY>/<MM>/`.
    pub create_subdirectories: bool,

    /// Embed a `YYYYMMDD_HHMMSS` capture time in output names.
    pub add_timestamp: bool,

    /// Keep the source stem as the output name prefix instead of `document`.
    pub preserve_original_names: bool,

    /// Soft cap reported by statistics; never enforced on write.
    pub max_files_per_directory: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_output_dir: Utf8PathBuf::from(DEFAULT_BASE_OUTPUT_DIR),
            auto_cleanup_days: default_auto_cleanup_days(),
            create_subdirectories: true,
            add_timestamp: true,
            preserve_original_names: true,
            max_files_per_directory: default_max_files_per_directory(),
        }
    }
}

pub const DEFAULT_BASE_OUTPUT_DIR: &str = "output";

fn default_auto_cleanup_days() -> u32 {
    30
}

fn default_max_files_per_directory() -> u32 {
    1000
}

/// Reasons a structurally valid configuration is still unusable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("base_output_dir must not be empty")]
    EmptyBaseOutputDir,

    #[error("max_files_per_directory must be positive")]
    ZeroMaxFilesPerDirectory,
}

impl OutputConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.base_output_dir.as_str().trim().is_empty() {
            return Err(ConfigValidationError::EmptyBaseOutputDir);
        }
        if self.max_files_per_directory == 0 {
            return Err(ConfigValidationError::ZeroMaxFilesPerDirectory);
        }
        Ok(())
    }

    /// Whether age-based cleanup is enabled
    pub fn cleanup_enabled(&self) -> bool {
        self.auto_cleanup_days > 0
    }
}
