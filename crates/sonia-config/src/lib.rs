//! Sonia Config - Configuration types and loader.
//!
//! One TOML file configures the whole runtime. Every section defaults to
//! working local values so a bare `[section]` header (or no file at all)
//! produces a runnable configuration.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use types::{
    BackupSection, GatewaySection, RetrievalSection, ServiceEntry, SoniaConfig, StorageSection,
    SupervisorSection, ToolsSection,
};

use std::path::Path;
use tracing::info;

/// Load configuration from a TOML file, falling back to defaults when the
/// file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file exists but is malformed, or when
/// the resulting configuration fails validation.
pub fn load(path: Option<&Path>) -> ConfigResult<SoniaConfig> {
    let config = match path {
        Some(p) if p.exists() => {
            let raw = std::fs::read_to_string(p).map_err(|e| ConfigError::Io {
                path: p.display().to_string(),
                source: e,
            })?;
            let config: SoniaConfig = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: p.display().to_string(),
                source: e,
            })?;
            info!(path = %p.display(), "loaded configuration");
            config
        }
        Some(p) => {
            info!(path = %p.display(), "config file missing, using defaults");
            SoniaConfig::default()
        }
        None => SoniaConfig::default(),
    };
    config.validate()?;
    Ok(config)
}
