//! Error types for spec validation and build orchestration.

use std::path::PathBuf;

use hdist_common::HashError;
use hdist_runner::JobError;
use hdist_source_cache::SourceCacheError;
use hdist_store::StoreError;

/// Errors raised while validating specs or running builds.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The build spec is malformed. Raised before any filesystem
    /// mutation.
    #[error("invalid build spec: {reason}")]
    Spec {
        /// Description of the problem.
        reason: String,
    },

    /// A declared source target escapes the build directory.
    #[error("source target \"{target}\" attempted to escape from build directory")]
    SourceTargetEscape {
        /// The offending target.
        target: String,
    },

    /// The spec could not be hashed.
    #[error(transparent)]
    Hash(#[from] HashError),

    /// A source cache operation failed.
    #[error(transparent)]
    SourceCache(#[from] SourceCacheError),

    /// An artifact store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job failed; the build directory is retained or removed
    /// according to the keep policy and its path travels with the error.
    #[error("build of {id} failed in {build_dir}: {source}")]
    Job {
        /// The artifact that was being built.
        id: String,
        /// The build directory of the failed attempt.
        build_dir: PathBuf,
        /// The underlying job failure.
        source: JobError,
    },

    /// An in-process tool was invoked with bad arguments or failed.
    #[error("{tool}: {reason}")]
    Tool {
        /// The tool verb.
        tool: String,
        /// Description of the failure.
        reason: String,
    },

    /// A file or tree is not relocatable.
    #[error("{path} contains the absolute artifact path and is not relocatable")]
    NotRelocatable {
        /// The offending file.
        path: PathBuf,
    },

    /// An I/O error during orchestration.
    #[error("build I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl BuildError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The build directory of a failed attempt, when available.
    pub fn build_dir(&self) -> Option<&PathBuf> {
        match self {
            BuildError::Job { build_dir, .. } => Some(build_dir),
            _ => None,
        }
    }

    /// The subprocess exit code, when the failure was a command exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BuildError::Job { source, .. } => source.exit_code(),
            _ => None,
        }
    }
}
