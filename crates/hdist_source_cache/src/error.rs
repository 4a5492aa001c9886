//! Error types for source cache operations.

use std::path::PathBuf;

/// Errors that can occur while fetching, storing or unpacking sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceCacheError {
    /// An I/O error occurred inside the cache or the target directory.
    #[error("source cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A URL could not be parsed or uses an unsupported form.
    #[error("invalid source url \"{url}\": {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Description of the problem.
        reason: String,
    },

    /// A download failed or the downloaded bytes are not a valid archive.
    #[error("failed to fetch \"{url}\": {reason}")]
    DownloadFailed {
        /// The URL that was fetched.
        url: String,
        /// Description of the failure.
        reason: String,
    },

    /// The downloaded bytes hash to something other than the expected
    /// digest. The temporary file has been removed and the cache is
    /// unchanged.
    #[error("file downloaded from \"{url}\" has digest {actual} but expected {expected}")]
    DigestMismatch {
        /// The URL that was fetched.
        url: String,
        /// The digest the caller expected.
        expected: String,
        /// The digest of the bytes actually received.
        actual: String,
    },

    /// The requested key is not present in the cache.
    #[error("key \"{key}\" not found in source cache")]
    KeyNotFound {
        /// The missing key.
        key: String,
    },

    /// A source key is syntactically malformed.
    #[error("malformed source key \"{key}\": {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Description of the problem.
        reason: String,
    },

    /// Stored bytes no longer match their digest (safe-mode verification).
    #[error("corrupted source cache entry: {path}")]
    Corrupt {
        /// The pack file that failed verification.
        path: PathBuf,
    },

    /// An archive entry attempted to escape the extraction target.
    #[error("archive entry \"{entry}\" attempted to break out of target directory")]
    Security {
        /// The offending entry path, as stored in the archive.
        entry: String,
    },

    /// A source key carries a scheme this cache does not know.
    #[error("unknown source key scheme \"{scheme}\"")]
    UnknownScheme {
        /// The unrecognized scheme.
        scheme: String,
    },

    /// The archive type could not be inferred from the URL.
    #[error("unable to guess archive type of \"{url}\"")]
    UnknownArchiveType {
        /// The URL whose extension was inspected.
        url: String,
    },

    /// A git operation failed.
    #[error("git: {message}")]
    Git {
        /// Description of the failure.
        message: String,
    },

    /// A `files:` bundle could not be decoded.
    #[error("malformed files bundle at {path}: {reason}")]
    MalformedBundle {
        /// The pack file holding the bundle.
        path: PathBuf,
        /// Description of the problem.
        reason: String,
    },
}

impl SourceCacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
