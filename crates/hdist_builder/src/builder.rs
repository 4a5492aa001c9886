//! The build orchestrator: hash, check, build, register.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use hdist_common::fileutils::{gzip_compress, write_protect};
use hdist_common::ArtifactId;
use hdist_config::KeepPolicy;
use hdist_logging::Logger;
use hdist_runner::run_job;
use hdist_source_cache::SourceCache;
use hdist_store::{BuildStore, StageOutcome};

use crate::error::BuildError;
use crate::hit::BuildTools;
use crate::sources::unpack_sources;
use crate::spec::BuildSpec;

/// Ties the stores together and drives builds.
pub struct Builder<'a> {
    store: &'a BuildStore,
    source_cache: &'a SourceCache,
    logger: &'a Logger,
}

impl<'a> Builder<'a> {
    /// Creates a builder over the given stores.
    pub fn new(store: &'a BuildStore, source_cache: &'a SourceCache, logger: &'a Logger) -> Self {
        Self {
            store,
            source_cache,
            logger,
        }
    }

    /// The artifact store this builder registers into.
    pub fn store(&self) -> &BuildStore {
        self.store
    }

    /// True if the spec's artifact is already registered.
    pub fn is_present(&self, spec: &BuildSpec) -> Result<bool, BuildError> {
        Ok(self.store.resolve(spec.artifact_id())?.is_some())
    }

    /// Ensures the spec's artifact exists, building it if needed.
    ///
    /// Returns the artifact ID and its directory. When the artifact is
    /// already present (or a racing worker registers it first) the
    /// existing path is returned without building.
    pub fn ensure_present(
        &self,
        spec: &BuildSpec,
        virtuals: &HashMap<String, ArtifactId>,
        keep_build: KeepPolicy,
    ) -> Result<(ArtifactId, PathBuf), BuildError> {
        let id = spec.artifact_id().clone();
        if let Some(existing) = self.store.resolve(&id)? {
            return Ok((id, existing));
        }

        let artifact_dir = match self.store.make_artifact_dir(&id, spec.version())? {
            StageOutcome::Created(dir) => dir,
            StageOutcome::AlreadyRegistered(dir) => return Ok((id, dir)),
        };

        match self.build_to(spec, &artifact_dir, virtuals, keep_build) {
            Ok(()) => {
                let final_dir = self.store.register_artifact(&id, &artifact_dir)?;
                Ok((id, final_dir))
            }
            Err(e) => {
                // Never leave a half-built directory behind; the database
                // entry was never created so removal is enough.
                let _ = fs::remove_dir_all(&artifact_dir);
                Err(e)
            }
        }
    }

    fn build_to(
        &self,
        spec: &BuildSpec,
        artifact_dir: &Path,
        virtuals: &HashMap<String, ArtifactId>,
        keep_build: KeepPolicy,
    ) -> Result<(), BuildError> {
        let build_dir = self
            .store
            .make_build_dir(spec.artifact_id(), spec.version())?;

        // Setup failures are bugs in the spec or the environment; the
        // build directory holds nothing of interest yet, so it goes
        // regardless of policy.
        if let Err(e) = self.populate_build_dir(spec, &build_dir) {
            let _ = self.store.remove_build_dir(&build_dir);
            return Err(e);
        }

        match self.run_build(spec, artifact_dir, &build_dir, virtuals) {
            Ok(()) => {
                if keep_build != KeepPolicy::Always {
                    self.store.remove_build_dir(&build_dir)?;
                }
                Ok(())
            }
            Err(e) => {
                if keep_build == KeepPolicy::Never {
                    let _ = self.store.remove_build_dir(&build_dir);
                }
                Err(e)
            }
        }
    }

    fn populate_build_dir(&self, spec: &BuildSpec, build_dir: &Path) -> Result<(), BuildError> {
        serialize_spec(spec, build_dir, false)?;
        unpack_sources(self.source_cache, spec.sources(), build_dir)
    }

    fn run_build(
        &self,
        spec: &BuildSpec,
        artifact_dir: &Path,
        build_dir: &Path,
        virtuals: &HashMap<String, ArtifactId>,
    ) -> Result<(), BuildError> {
        let id = spec.artifact_id();
        let log_path = build_dir.join("build.log");
        let log_file = fs::File::create(&log_path).map_err(|e| BuildError::io(&log_path, e))?;

        self.logger.info(&format!(
            "building {}/{}.., follow log with:",
            id.name,
            id.digest.short(12)
        ));
        self.logger.info(&format!("  tail -f {}", log_path.display()));

        let mut env = BTreeMap::new();
        env.insert("ARTIFACT".to_string(), artifact_dir.display().to_string());
        env.insert("BUILD".to_string(), build_dir.display().to_string());

        let tools = BuildTools {
            source_cache: self.source_cache,
        };

        let sub_logger = self.logger.sub_logger(&id.name);
        sub_logger.push_raw_stream(Box::new(log_file));
        let result = run_job(
            &sub_logger,
            self.store,
            spec.build(),
            &env,
            virtuals,
            build_dir,
            &tools,
        );
        sub_logger.pop_stream();

        result.map_err(|source| BuildError::Job {
            id: id.to_string(),
            build_dir: build_dir.to_path_buf(),
            source,
        })?;

        // Success: persist the spec, the ID marker, and the compressed
        // log into the artifact before registration, all write-protected
        // so nothing half-built can ever be registered mutable.
        serialize_spec(spec, artifact_dir, true)?;

        let id_path = artifact_dir.join("id");
        fs::write(&id_path, format!("{id}\n")).map_err(|e| BuildError::io(&id_path, e))?;
        write_protect(&id_path).map_err(|e| BuildError::io(&id_path, e))?;

        let log_gz = artifact_dir.join("build.log.gz");
        gzip_compress(&log_path, &log_gz).map_err(|e| BuildError::io(&log_gz, e))?;
        write_protect(&log_gz).map_err(|e| BuildError::io(&log_gz, e))?;
        Ok(())
    }
}

fn serialize_spec(spec: &BuildSpec, dir: &Path, protect: bool) -> Result<(), BuildError> {
    let path = dir.join("build.json");
    fs::write(&path, spec.canonical_json()).map_err(|e| BuildError::io(&path, e))?;
    if protect {
        write_protect(&path).map_err(|e| BuildError::io(&path, e))?;
    }
    Ok(())
}
