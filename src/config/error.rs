//! Configuration Error Types

use std::path::PathBuf;
use thiserror::Error;

use crate::error::ConductorError;

/// Configuration-related errors with detailed context
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Explicitly requested configuration file does not exist
    #[error("Configuration file not found: {path}")]
    ConfigFileNotFound { path: PathBuf },

    /// The `config` crate failed to read or merge a source
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;

impl From<ConfigurationError> for ConductorError {
    fn from(error: ConfigurationError) -> Self {
        ConductorError::Configuration(error.to_string())
    }
}
