//! Error types for job execution.

use std::path::PathBuf;

use hdist_store::StoreError;

/// Errors raised while preparing or running a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The job spec is malformed (duplicate imports, import cycles, bad
    /// command payloads). Raised before any filesystem mutation.
    #[error("invalid job spec: {reason}")]
    InvalidSpec {
        /// Description of the problem.
        reason: String,
    },

    /// A `$NAME` reference has no binding in the current environment.
    #[error("undefined variable ${name} in \"{input}\"")]
    UndefinedVariable {
        /// The unresolved variable name.
        name: String,
        /// The string being substituted.
        input: String,
    },

    /// A string could not be substituted (`$$`, dangling `$`, unclosed
    /// `${`).
    #[error("bad substitution in \"{input}\": {reason}")]
    BadSubstitution {
        /// The string being substituted.
        input: String,
        /// Description of the problem.
        reason: String,
    },

    /// An import names a virtual artifact the caller did not bind.
    #[error("job spec contained a virtual dependency \"{id}\" that was not provided")]
    UnresolvedVirtual {
        /// The unbound virtual ID.
        id: String,
    },

    /// An imported artifact is not present in the store.
    #[error("dependency \"{id}\" not already built, please build it first")]
    ImportNotBuilt {
        /// The missing artifact.
        id: String,
    },

    /// An imported artifact has several `lib*` directories, so its link
    /// flags are ambiguous.
    #[error("artifact {id} has more than one library dir ({dirs:?})")]
    AmbiguousLibDir {
        /// The importing artifact.
        id: String,
        /// The conflicting directory names.
        dirs: Vec<String>,
    },

    /// A store lookup failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A subprocess exited with a non-zero code.
    #[error("command {argv:?} failed with code {code}")]
    CommandFailed {
        /// The argv that was spawned.
        argv: Vec<String>,
        /// The exit code (or -1 when killed by a signal).
        code: i32,
    },

    /// The executable was not found in `PATH`.
    #[error("command \"{command}\" not found in PATH (cwd: \"{cwd}\")")]
    CommandNotFound {
        /// The missing executable.
        command: String,
        /// The working directory of the attempted spawn.
        cwd: PathBuf,
    },

    /// Redirecting a command's stdout into a log pipe is not supported;
    /// only subprocess writes to the FIFO are.
    #[error("cannot redirect stdout to a log pipe (write from a subprocess instead)")]
    LogPipeRedirect,

    /// An in-process `hit` invocation failed.
    #[error("hit {verb} failed: {message}")]
    Tool {
        /// The failing verb.
        verb: String,
        /// Description of the failure.
        message: String,
    },

    /// An I/O error during job execution.
    #[error("job I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl JobError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The subprocess exit code, when this error is a command failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobError::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}
