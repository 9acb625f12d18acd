//! Configuration management for the viewer service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use crate::ingestion::{IngestSettings, RetryPolicy};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the viewer service.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewerConfig {
    /// Frame ingestion configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Frame descriptor source
    pub source: SourceConfig,

    /// Annotation exchange configuration
    #[serde(default)]
    pub annotations: AnnotationsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Frame ingestion configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Maximum fetches in flight at once
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,

    /// Maximum number of images to load (0 = unlimited)
    #[serde(default)]
    pub max_images_to_load: usize,

    /// Attempts per frame, counting the first one
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,

    /// Base delay between retries in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

/// Where frame descriptors are read from.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Directory holding one descriptor file per frame
    pub frames_dir: PathBuf,

    /// Descriptor file extension
    #[serde(default = "default_extension")]
    pub extension: String,
}

/// Annotation exchange configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationsConfig {
    /// Document to import after loading
    #[serde(default)]
    pub import_path: Option<PathBuf>,

    /// Where to write the exported document
    #[serde(default)]
    pub export_path: Option<PathBuf>,

    /// Pretty-print exported documents
    #[serde(default = "default_pretty")]
    pub pretty: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_max_concurrent_fetches() -> usize {
    8
}
fn default_max_fetch_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_max_delay_ms() -> u64 {
    2000
}
fn default_extension() -> String {
    "json".to_string()
}
fn default_pretty() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_concurrent_fetches(),
            max_images_to_load: 0,
            max_fetch_attempts: default_max_fetch_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl Default for AnnotationsConfig {
    fn default() -> Self {
        Self {
            import_path: None,
            export_path: None,
            pretty: default_pretty(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ViewerConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with VIEWER_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. VIEWER__SOURCE__FRAMES_DIR
            .add_source(
                Environment::with_prefix("VIEWER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("VIEWER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.source.frames_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "source.frames_dir".to_string(),
            ));
        }

        if self.ingest.max_concurrent_fetches == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.max_concurrent_fetches".to_string(),
                message: "Concurrency must be greater than 0".to_string(),
            });
        }

        if self.ingest.max_fetch_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.max_fetch_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        if self.ingest.retry_base_delay_ms > self.ingest.retry_max_delay_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "ingest.retry_base_delay_ms".to_string(),
                message: "Base delay must not exceed the maximum delay".to_string(),
            });
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::InvalidValue {
                field: "logging.format".to_string(),
                message: format!("Unknown format '{}', expected json or pretty", self.logging.format),
            });
        }

        Ok(())
    }
}

impl IngestConfig {
    /// Get base retry delay as Duration.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Get maximum retry delay as Duration.
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// The image limit passed to `load`, if any.
    pub fn image_limit(&self) -> Option<usize> {
        (self.max_images_to_load > 0).then_some(self.max_images_to_load)
    }

    pub fn settings(&self) -> IngestSettings {
        IngestSettings {
            max_concurrent_fetches: self.max_concurrent_fetches,
            retry: RetryPolicy {
                max_attempts: self.max_fetch_attempts,
                base_delay: self.retry_base_delay(),
                max_delay: self.retry_max_delay(),
            },
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
