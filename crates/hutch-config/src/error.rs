//! Configuration error types.

use crate::validation::{format_validation_errors, ConfigValidationError};
use thiserror::Error;

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration source could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// A broker URL could not be parsed.
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    /// The configuration was loaded but failed validation.
    #[error("{}", format_validation_errors(.0))]
    Invalid(Vec<ConfigValidationError>),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

impl From<Vec<ConfigValidationError>> for ConfigError {
    fn from(errors: Vec<ConfigValidationError>) -> Self {
        ConfigError::Invalid(errors)
    }
}
