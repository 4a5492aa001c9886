//! Error types for configuration loading.

use std::path::PathBuf;

/// Errors that can occur while loading `hdist.toml`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config at {path}: {source}")]
    Io {
        /// The path that failed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse hdist.toml: {0}")]
    Parse(String),

    /// A field holds a value outside its allowed domain.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// The offending field, dotted-path style.
        field: String,
        /// Description of the problem.
        reason: String,
    },
}
