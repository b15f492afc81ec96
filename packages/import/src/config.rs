//! Batch processor configuration.
//!
//! Defaults live in `config/pipeline.toml`, embedded at compile time.
//! Embedding applications can load their own file with
//! [`ProcessorConfig::load`] or build one in code.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_BATCH_DELAY_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

const EMBEDDED_CONFIG: &str = include_str!("../config/pipeline.toml");

/// Errors from loading a [`ProcessorConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML is malformed or has unknown keys.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("Invalid config: {message}")]
    Invalid {
        /// Which value and why.
        message: String,
    },
}

/// Rate-limit and request settings for the geocoding phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Records geocoded concurrently per batch.
    pub batch_size: usize,
    /// Minimum pause between the end of one batch and the start of the next.
    pub batch_delay: Duration,
    /// Timeout for a single geocode request.
    pub request_timeout: Duration,
    /// Region bias passed to the provider.
    pub region: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            region: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineToml {
    #[serde(default)]
    processor: ProcessorToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessorToml {
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    batch_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    #[serde(default)]
    region: Option<String>,
}

impl Default for ProcessorToml {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            region: None,
        }
    }
}

const fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

const fn default_batch_delay_ms() -> u64 {
    DEFAULT_BATCH_DELAY_MS
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl ProcessorConfig {
    /// Parses a pipeline TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// or [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let parsed: PipelineToml = toml::from_str(toml_str)?;
        let processor = parsed.processor;

        let config = Self {
            batch_size: processor.batch_size,
            batch_delay: Duration::from_millis(processor.batch_delay_ms),
            request_timeout: Duration::from_secs(processor.request_timeout_secs),
            region: processor.region.filter(|r| !r.trim().is_empty()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads a pipeline TOML file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise
    /// see [`ProcessorConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        log::debug!("Loading pipeline config from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// The configuration compiled into the crate.
    ///
    /// # Errors
    ///
    /// See [`ProcessorConfig::from_toml_str`].
    pub fn embedded() -> Result<Self, ConfigError> {
        Self::from_toml_str(EMBEDDED_CONFIG)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `batch_size` or
    /// `request_timeout` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                message: "batch_size must be at least 1".to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                message: "request_timeout_secs must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the inter-batch delay.
    #[must_use]
    pub const fn with_batch_delay(mut self, batch_delay: Duration) -> Self {
        self.batch_delay = batch_delay;
        self
    }

    /// Sets the region hint.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}
