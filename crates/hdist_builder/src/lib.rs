//! Build orchestration: the hash→build→store contract.
//!
//! Given a canonicalized build spec this crate checks the artifact store,
//! and — when absent — stages an artifact directory, prepares a temporary
//! build directory with the declared sources, runs the job, and registers
//! the result atomically. It also implements the in-process `hit` tool
//! surface jobs can call (source unpacking, inline file materialization,
//! the links DSL, and artifact post-processing).

#![warn(missing_docs)]

mod builder;
mod error;
mod files;
mod hit;
mod links;
mod postprocess;
mod sources;
mod spec;

pub use builder::Builder;
pub use error::BuildError;
pub use files::{execute_files_dsl, FileSpec};
pub use hit::BuildTools;
pub use links::{dry_run_links_dsl, execute_links_dsl, LinkAction, LinkRule, PlannedLink};
pub use postprocess::{postprocess, PostprocessOptions, ShebangMode};
pub use sources::unpack_sources;
pub use spec::{BuildSpec, SourceRecord};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::io::Read;
    use std::path::{Path, PathBuf};

    use hdist_config::KeepPolicy;
    use hdist_logging::{CapturedLog, Level, Logger};
    use hdist_source_cache::{Scheme, SourceCache, SourceKey};
    use hdist_store::BuildStore;
    use serde_json::json;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        store: BuildStore,
        source_cache: SourceCache,
        logger: Logger,
        capture: CapturedLog,
    }

    impl Fixture {
        fn new() -> Fixture {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().to_path_buf();
            let store = BuildStore::open(
                &root.join("bld"),
                &root.join("db"),
                &root.join("opt"),
                "{name}/{shorthash}",
            )
            .unwrap();
            let source_cache = SourceCache::new(&root.join("src")).unwrap();
            let logger = Logger::quiet(Level::Debug);
            let capture = logger.push_capture();
            Fixture {
                _tmp: tmp,
                root,
                store,
                source_cache,
                logger,
                capture,
            }
        }

        fn builder(&self) -> Builder<'_> {
            Builder::new(&self.store, &self.source_cache, &self.logger)
        }

        fn ensure(
            &self,
            doc: serde_json::Value,
            keep: KeepPolicy,
        ) -> Result<(hdist_common::ArtifactId, PathBuf), BuildError> {
            let spec = BuildSpec::from_value(doc).unwrap();
            self.builder().ensure_present(&spec, &HashMap::new(), keep)
        }

        /// Stores a tarball with the given entries and returns its key.
        fn put_tarball(&self, entries: &[(&str, &str)]) -> SourceKey {
            let tar_path = self.root.join("fixture.tar.gz");
            let file = fs::File::create(&tar_path).unwrap();
            let encoder =
                flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            for (path, contents) in entries {
                let mut header = tar::Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder
                    .append_data(&mut header, path, contents.as_bytes())
                    .unwrap();
            }
            builder.into_inner().unwrap().finish().unwrap();
            let digest =
                hdist_common::Digest::from_data(&fs::read(&tar_path).unwrap()).to_string();
            let key = SourceKey::new(Scheme::TarGz, &digest).unwrap();
            self.source_cache
                .fetch(Some(&format!("file:{}", tar_path.display())), &key, "fixture")
                .unwrap();
            key
        }
    }

    fn read_gz(path: &Path) -> String {
        let mut decoder = flate2::read::GzDecoder::new(fs::File::open(path).unwrap());
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn empty_build_produces_marker_files() {
        let fx = Fixture::new();
        let doc = json!({"name": "foo", "version": "na", "build": {"commands": []}});

        let spec = BuildSpec::from_value(doc.clone()).unwrap();
        assert!(!fx.builder().is_present(&spec).unwrap());

        let (id, path) = fx.ensure(doc.clone(), KeepPolicy::Never).unwrap();
        assert!(fx.builder().is_present(&spec).unwrap());

        let mut names: Vec<String> = fs::read_dir(&path)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["build.json", "build.log.gz", "id"]);

        assert_eq!(
            fs::read_to_string(path.join("id")).unwrap().trim(),
            id.to_string()
        );

        // A second call resolves to the same path without building.
        let (_, again) = fx.ensure(doc, KeepPolicy::Never).unwrap();
        assert_eq!(path, again);

        // The build temp area is empty again.
        assert_eq!(fs::read_dir(fx.root.join("bld")).unwrap().count(), 0);
    }

    #[test]
    fn registered_build_json_round_trips_to_same_id() {
        let fx = Fixture::new();
        let doc = json!({"name": "foo", "version": "na", "build": {"commands": []}});
        let (id, path) = fx.ensure(doc, KeepPolicy::Never).unwrap();

        let persisted = fs::read_to_string(path.join("build.json")).unwrap();
        let reparsed = BuildSpec::from_json(&persisted).unwrap();
        assert_eq!(reparsed.artifact_id(), &id);

        // And it is write-protected.
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path.join("build.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o222, 0);
    }

    #[test]
    fn sources_unpack_at_each_target() {
        let fx = Fixture::new();
        let key = fx.put_tarball(&[("coolproject-2.3/README", "Welcome!")]);

        let doc = json!({
            "name": "foo", "version": "na",
            "sources": [
                {"key": key.to_string(), "target": "."},
                {"key": key.to_string(), "target": "subdir"},
            ],
            "build": {"commands": [
                {"cmd": ["/bin/cp", "subdir/README", "$ARTIFACT/a"]},
                {"cmd": ["/bin/cp", "README", "$ARTIFACT/b"]},
            ]}
        });
        let (_, path) = fx.ensure(doc, KeepPolicy::Never).unwrap();
        assert_eq!(fs::read_to_string(path.join("a")).unwrap(), "Welcome!");
        assert_eq!(fs::read_to_string(path.join("b")).unwrap(), "Welcome!");
    }

    #[test]
    fn escaping_source_target_rejected_before_unpack() {
        let fx = Fixture::new();
        let key = fx.put_tarball(&[("f", "x")]);
        let doc = json!({
            "name": "foo", "version": "na",
            "sources": [{"key": key.to_string(), "target": "../evil"}],
            "build": {"commands": []}
        });
        let err = fx.ensure(doc, KeepPolicy::Never).unwrap_err();
        assert!(matches!(err, BuildError::SourceTargetEscape { .. }));
        // Nothing was registered or left staged.
        assert_eq!(fs::read_dir(fx.root.join("bld")).unwrap().count(), 0);
    }

    #[test]
    fn imports_resolve_through_refs_and_virtuals() {
        let fx = Fixture::new();
        let empty = |name: &str| {
            json!({"name": name, "version": "na", "build": {"commands": []}})
        };
        let (foo_id, foo_path) = fx.ensure(empty("foosoft"), KeepPolicy::Never).unwrap();
        let (bar_id, bar_path) = fx.ensure(empty("barsoft"), KeepPolicy::Never).unwrap();

        let mut virtuals = HashMap::new();
        virtuals.insert("virtual:bar".to_string(), bar_id.clone());

        let doc = json!({
            "name": "dependent", "version": "na",
            "build": {
                "import": [
                    {"ref": "FOOSOFT", "id": foo_id.to_string()},
                    {"ref": "BARSOFT", "id": "virtual:bar"},
                ],
                "commands": [
                    {"cmd": ["/bin/sh", "-c",
                        "echo \\$FOOSOFT_DIR; echo \\$BARSOFT_DIR; echo \\$FOOSOFT_ID; echo \\$BARSOFT_ID"]},
                ],
            }
        });
        let spec = BuildSpec::from_value(doc).unwrap();
        fx.builder()
            .ensure_present(&spec, &virtuals, KeepPolicy::Never)
            .unwrap();

        let expected = [
            foo_path.display().to_string(),
            bar_path.display().to_string(),
            foo_id.to_string(),
            bar_id.to_string(),
        ];
        let stdout_lines: Vec<String> = fx
            .capture
            .records()
            .into_iter()
            .filter(|r| r.names.last().map(String::as_str) == Some("stdout"))
            .map(|r| r.message)
            .collect();
        assert_eq!(stdout_lines, expected, "all lines: {:?}", fx.capture.lines());
    }

    #[test]
    fn log_pipe_entries_reach_the_log() {
        let fx = Fixture::new();
        let doc = json!({
            "name": "piper", "version": "na",
            "build": {"commands": [
                {"cmd": ["/bin/sh", "-c", "printf 'hello from pipe' > hello"]},
                {"hit": ["logpipe", "mylog", "WARNING"], "to_var": "LOG"},
                {"cmd": ["/bin/dd", "if=hello", "of=$LOG"]},
            ]}
        });
        fx.ensure(doc, KeepPolicy::Never).unwrap();
        let records = fx.capture.records();
        let entry = records
            .iter()
            .find(|r| r.names.last().map(String::as_str) == Some("mylog"))
            .unwrap_or_else(|| panic!("no mylog entry in {:?}", fx.capture.lines()));
        assert_eq!(entry.level, Level::Warning);
        assert_eq!(entry.message, "hello from pipe");
    }

    #[test]
    fn failure_applies_keep_policy() {
        let fx = Fixture::new();
        let doc = json!({
            "name": "fails", "version": "na",
            "build": {"commands": [
                {"cmd": ["/bin/echo", "test"], "append_to_file": "foo2"},
                {"cmd": ["/bin/true"]},
                {"cmd": ["/bin/false"]},
            ]}
        });

        let err = fx.ensure(doc.clone(), KeepPolicy::OnError).unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        let kept = err.build_dir().unwrap().clone();
        assert!(kept.join("foo2").exists());
        assert_eq!(fs::read_to_string(kept.join("foo2")).unwrap(), "test\n");

        let err = fx.ensure(doc, KeepPolicy::Never).unwrap_err();
        let gone = err.build_dir().unwrap().clone();
        assert_ne!(kept, gone);
        assert!(!gone.exists());

        // Failed builds are never registered.
        assert_eq!(fs::read_dir(fx.root.join("db/artifacts")).unwrap().count(), 0);
    }

    #[test]
    fn build_log_is_captured_and_compressed() {
        let fx = Fixture::new();
        let doc = json!({
            "name": "noisy", "version": "na",
            "build": {"commands": [
                {"cmd": ["/bin/sh", "-c", "echo hi stdout; echo hi stderr >&2"]},
            ]}
        });
        let (_, path) = fx.ensure(doc, KeepPolicy::Never).unwrap();
        let log = read_gz(&path.join("build.log.gz"));
        assert!(log.contains("hi stdout"), "log was: {log}");
        assert!(log.contains("hi stderr"));
    }

    #[test]
    fn inline_files_written_during_job() {
        let fx = Fixture::new();
        let doc = json!({
            "name": "withfiles", "version": "na",
            "files": [
                {"target": "$ARTIFACT/$BAR/foo", "text": ["foo${BAR}foo"], "expandvars": true}
            ],
            "build": {"commands": [
                {"set": "BAR", "value": "bar"},
                {"hit": ["build-write-files", "--key=files", "build.json"]},
            ]}
        });
        let (_, path) = fx.ensure(doc, KeepPolicy::Never).unwrap();
        assert_eq!(
            fs::read_to_string(path.join("bar/foo")).unwrap(),
            "foobarfoo"
        );
    }

    #[test]
    fn in_job_source_unpack_reads_spec() {
        let fx = Fixture::new();
        let key = fx.put_tarball(&[("pkg-1.0/data", "payload")]);
        let doc = json!({
            "name": "lazy", "version": "na",
            "extra_sources": [{"key": key.to_string(), "target": "from-job"}],
            "build": {"commands": [
                {"hit": ["build-unpack-sources", "--key=extra_sources"]},
                {"cmd": ["/bin/cp", "from-job/data", "$ARTIFACT/data"]},
            ]}
        });
        let (_, path) = fx.ensure(doc, KeepPolicy::Never).unwrap();
        assert_eq!(fs::read_to_string(path.join("data")).unwrap(), "payload");
    }

    #[test]
    fn keep_always_retains_successful_build_dir() {
        let fx = Fixture::new();
        let doc = json!({"name": "kept", "version": "na", "build": {"commands": []}});
        fx.ensure(doc, KeepPolicy::Always).unwrap();
        assert_eq!(fs::read_dir(fx.root.join("bld")).unwrap().count(), 1);
    }

    #[test]
    fn identical_specs_reuse_the_artifact() {
        let fx = Fixture::new();
        let doc = json!({
            "name": "foo", "version": "na",
            "build": {"commands": []},
            "nohash_hint": "changes freely"
        });
        let (id1, path1) = fx.ensure(doc, KeepPolicy::Never).unwrap();
        let doc2 = json!({
            "name": "foo", "version": "na",
            "build": {"commands": []},
            "nohash_hint": "something else entirely"
        });
        let (id2, path2) = fx.ensure(doc2, KeepPolicy::Never).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(path1, path2);
    }
}
