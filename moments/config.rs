//! Engine settings loaded from a TOML file. Every field has a default, so an
//! empty file (or no file at all) is a valid configuration.

use crate::chunked::{ChunkOptions, DEFAULT_MAX_BLOCK_ROWS};
use crate::types::{DEFAULT_MAX_CLASSES, EstimateOptions, Normalization};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Largest table the loader will materialize before asking for the chunked path.
pub const DEFAULT_MAX_IN_MEMORY_ROWS: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub normalization: Normalization,
    /// Compute covariances as well as means.
    pub covariances: bool,
    /// Upper bound on rows requested from a chunked source per block.
    pub max_block_rows: usize,
    /// Upper bound on rows loaded into a single in-memory matrix.
    pub max_in_memory_rows: usize,
    /// Upper bound on the hard-label class count, declared or inferred.
    pub max_classes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            normalization: Normalization::Unbiased,
            covariances: true,
            max_block_rows: DEFAULT_MAX_BLOCK_ROWS,
            max_in_memory_rows: DEFAULT_MAX_IN_MEMORY_ROWS,
            max_classes: DEFAULT_MAX_CLASSES,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_block_rows == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_block_rows",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_in_memory_rows == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_in_memory_rows",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_classes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_classes",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn estimate_options(&self) -> EstimateOptions {
        EstimateOptions {
            normalization: self.normalization,
            covariances: self.covariances,
            max_classes: self.max_classes,
        }
    }

    pub fn chunk_options(&self) -> ChunkOptions {
        ChunkOptions::new(self.estimate_options(), self.max_block_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.chunk_options().max_block_rows, DEFAULT_MAX_BLOCK_ROWS);
        assert!(config.estimate_options().covariances);
    }

    #[test]
    fn values_are_read_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "normalization = \"biased\"\ncovariances = false\nmax_block_rows = 128"
        )
        .unwrap();
        file.flush().unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.normalization, Normalization::Biased);
        assert!(!config.covariances);
        assert_eq!(config.max_block_rows, 128);
        assert_eq!(config.max_in_memory_rows, DEFAULT_MAX_IN_MEMORY_ROWS);
        assert_eq!(
            config.estimate_options(),
            EstimateOptions::means_only(Normalization::Biased)
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        match EngineConfig::from_toml_str("max_block_rows = 0") {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "max_block_rows"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
        assert!(matches!(
            EngineConfig::from_toml_str("normalization = \"sometimes\""),
            Err(ConfigError::TomlParseError(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("block_rows = 3"),
            Err(ConfigError::TomlParseError(_))
        ));
    }

    #[test]
    fn class_limit_flows_into_both_option_sets() {
        let config = EngineConfig::from_toml_str("max_classes = 12").unwrap();
        assert_eq!(config.estimate_options().max_classes, 12);
        assert_eq!(config.chunk_options().estimate.max_classes, 12);
        assert!(matches!(
            EngineConfig::from_toml_str("max_classes = 0"),
            Err(ConfigError::InvalidValue { field: "max_classes", .. })
        ));
    }
}
