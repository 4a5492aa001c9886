//! Error types for artifact store operations.

use std::path::PathBuf;

/// Errors that can occur while resolving, staging or registering
/// artifacts.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O error occurred inside the store.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The store layout violates its invariants.
    ///
    /// Raised when a requested artifact shares its short-hash prefix with
    /// a registered artifact of a different full digest and no entry
    /// disambiguates them; resolving through such a store would risk
    /// silently returning the wrong artifact.
    #[error("illegal build store: artifacts \"{requested}\" and \"{existing}\" collide in first {prefix_len} chars")]
    IllegalStore {
        /// The artifact that was asked for.
        requested: String,
        /// The registered artifact it collides with.
        existing: String,
        /// Length of the colliding prefix.
        prefix_len: usize,
    },

    /// The artifact directory pattern is unusable.
    #[error("invalid artifact path pattern \"{pattern}\": {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Description of the problem.
        reason: String,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
