use crate::models::OutputConfig;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io::Write;
use tempfile::NamedTempFile;
use thiserror::Error;

/// File name of the persisted output configuration.
pub const CONFIG_FILE_NAME: &str = "output_config.yaml";

/// Suffix given to a malformed configuration file before it is replaced.
pub const CORRUPT_BACKUP_SUFFIX: &str = "corrupt";

/// Why a load fell back to defaults.
///
/// Loading never fails; these are surfaced to the caller as an optional
/// signal alongside a usable configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    #[error("Configuration file not found at {path}, using defaults")]
    Missing { path: Utf8PathBuf },

    #[error("Configuration file {path} could not be read ({message}), using defaults")]
    Unreadable { path: Utf8PathBuf, message: String },

    #[error("Configuration file {path} is malformed ({message}), using defaults")]
    Malformed { path: Utf8PathBuf, message: String },

    #[error("Configuration file {path} is invalid ({reason}), using defaults")]
    Invalid { path: Utf8PathBuf, reason: String },
}

/// Result of [`ConfigManager::load_output_config`].
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: OutputConfig,
    pub warning: Option<ConfigWarning>,
}

impl LoadedConfig {
    fn fallback(warning: ConfigWarning) -> Self {
        tracing::warn!("{}", warning);
        Self {
            config: OutputConfig::default(),
            warning: Some(warning),
        }
    }
}

/// Configuration manager for loading and saving the YAML output configuration.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    config_path: Utf8PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory holding `output_config.yaml` (created if missing)
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            config_path: config_dir.join(CONFIG_FILE_NAME),
            config_dir,
        })
    }

    /// Load the output configuration.
    ///
    /// Never fails: a missing, unreadable, malformed or invalid file yields
    /// defaults plus a [`ConfigWarning`]. The file on disk is left untouched.
    pub fn load_output_config(&self) -> LoadedConfig {
        if !self.config_path.exists() {
            let warning = ConfigWarning::Missing {
                path: self.config_path.clone(),
            };
            tracing::info!("{}", warning);
            return LoadedConfig {
                config: OutputConfig::default(),
                warning: Some(warning),
            };
        }

        let file_contents = match fs::read_to_string(&self.config_path) {
            Ok(contents) => contents,
            Err(e) => {
                return LoadedConfig::fallback(ConfigWarning::Unreadable {
                    path: self.config_path.clone(),
                    message: e.to_string(),
                });
            }
        };

        let config: OutputConfig = match serde_yaml_ng::from_str(&file_contents) {
            Ok(config) => config,
            Err(e) => {
                return LoadedConfig::fallback(ConfigWarning::Malformed {
                    path: self.config_path.clone(),
                    message: e.to_string(),
                });
            }
        };

        if let Err(e) = config.validate() {
            return LoadedConfig::fallback(ConfigWarning::Invalid {
                path: self.config_path.clone(),
                reason: e.to_string(),
            });
        }

        tracing::info!("Loaded output config from {}", self.config_path);
        LoadedConfig {
            config,
            warning: None,
        }
    }

    /// Save the output configuration atomically.
    ///
    /// The YAML is written to a temporary file next to the target and renamed
    /// into place. If the file currently on disk is unusable, it is first
    /// copied to `output_config.yaml.corrupt` so it survives for inspection.
    ///
    /// Callers must serialize saves; [`OutputStore`](crate::services::OutputStore)
    /// does this with its own lock.
    pub fn save_output_config(&self, config: &OutputConfig) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(config).context("Failed to serialize output config to YAML")?;

        if let Some(backup) = self.preserve_malformed_file()? {
            tracing::warn!(
                "Existing config {} was malformed, preserved as {} before overwriting",
                self.config_path,
                backup
            );
        }

        let mut temp = NamedTempFile::new_in(&self.config_dir).with_context(|| {
            format!("Failed to create temporary config file in {}", self.config_dir)
        })?;
        temp.write_all(yaml_string.as_bytes())
            .with_context(|| format!("Failed to write output config: {}", self.config_path))?;
        temp.as_file()
            .sync_all()
            .with_context(|| format!("Failed to sync output config: {}", self.config_path))?;
        temp.persist(&self.config_path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace output config: {}", self.config_path))?;

        tracing::info!("Saved output config to {}", self.config_path);
        Ok(())
    }

    /// Copy an unusable config file aside. Returns the backup path if one was made.
    ///
    /// A file is unusable when it is not UTF-8, does not parse, or parses into
    /// values that fail validation. A file that exists but cannot be read is
    /// copied as well; if that copy fails the save is refused.
    fn preserve_malformed_file(&self) -> Result<Option<Utf8PathBuf>> {
        match fs::read(&self.config_path) {
            Ok(bytes) if Self::is_usable(&bytes) => return Ok(None),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                tracing::warn!("Could not read existing config {}: {}", self.config_path, e);
            }
        }

        let backup = self.corrupt_backup_path();
        fs::copy(&self.config_path, &backup)
            .with_context(|| format!("Failed to preserve malformed config as {}", backup))?;
        Ok(Some(backup))
    }

    fn is_usable(bytes: &[u8]) -> bool {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|contents| serde_yaml_ng::from_str::<OutputConfig>(contents).ok())
            .is_some_and(|config| config.validate().is_ok())
    }

    /// Where a malformed configuration is preserved before being replaced.
    pub fn corrupt_backup_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.{}", self.config_path, CORRUPT_BACKUP_SUFFIX))
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    /// Get the configuration file path.
    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }
}
