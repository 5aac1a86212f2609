//! Configuration error types.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// The file that failed.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`crate::SoniaConfig`].
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// The file that failed.
        path: String,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },

    /// A field value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
