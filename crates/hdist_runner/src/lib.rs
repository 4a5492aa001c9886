//! Execution of build jobs in a controlled environment.
//!
//! A job spec carries imports, an initial environment, and a list of
//! structured commands (see [`spec`]). Running a job assembles the
//! environment from the imports — resolving `virtual:` IDs through a
//! caller-supplied map and recording the choice in `HDIST_VIRTUALS` —
//! then interprets the commands: variable assignment, directory changes,
//! nested scopes with snapshot semantics, subprocess spawns with
//! multiplexed output, and in-process `hit` tool calls.
//!
//! The runner is single-threaded and cooperative: the only blocking
//! points are subprocess waits and the 50 ms output poll. It never
//! retries; the first failing command fails the job.

#![warn(missing_docs)]

mod error;
mod exec;
mod imports;
mod multiplex;
mod spec;
mod substitute;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use hdist_common::ArtifactId;
use hdist_logging::Logger;
use hdist_store::BuildStore;

pub use error::JobError;
pub use exec::{HitContext, HitDispatcher, JobExecution, NoTools};
pub use imports::{imports_env, pack_virtuals, stable_topological_sort};
pub use spec::{
    AssignOp, Assignment, ExecCommand, ExecKind, ImportSpec, InputSpec, JobCommand, JobSpec,
};
pub use substitute::substitute;

/// Runs a job to completion.
///
/// `initial_env` seeds the environment (typically `BUILD` and `ARTIFACT`);
/// the job's own `env`/`nohash_env` sections and the import-derived
/// variables are layered on top. Returns the environment as modified by
/// the root scope of the command list.
pub fn run_job(
    logger: &Logger,
    store: &BuildStore,
    job_spec: &JobSpec,
    initial_env: &BTreeMap<String, String>,
    virtuals: &HashMap<String, ArtifactId>,
    cwd: &Path,
    dispatcher: &dyn HitDispatcher,
) -> Result<BTreeMap<String, String>, JobError> {
    let job = job_spec.clone().canonicalize()?;

    let mut env = initial_env.clone();
    env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(job.nohash_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(imports_env(store, virtuals, &job.imports)?);
    env.insert("HDIST_VIRTUALS".to_string(), pack_virtuals(virtuals));

    let mut execution = JobExecution::new(logger, dispatcher)?;
    execution.run(&job.commands, &env, cwd)
}
