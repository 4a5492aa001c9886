//! The in-process `hit` tool surface available to running jobs.
//!
//! When a job command uses the `hit` verb, the runner dispatches into the
//! same process through this module (except `logpipe`, which the runner
//! owns). Each tool operates on the job's current environment and working
//! directory and reads its parameters from a JSON document, usually the
//! job's own `build.json`.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::Value;

use hdist_runner::{HitContext, HitDispatcher};
use hdist_source_cache::SourceCache;

use crate::error::BuildError;
use crate::files::{execute_files_dsl, FileSpec};
use crate::links::{execute_links_dsl, LinkRule};
use crate::postprocess::{postprocess, PostprocessOptions, ShebangMode};
use crate::sources::unpack_sources;
use crate::spec::SourceRecord;

type ToolResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The standard tool set handed to [`hdist_runner::run_job`] by the
/// builder and the CLI.
pub struct BuildTools<'a> {
    /// Cache the `build-unpack-sources` verb reads from.
    pub source_cache: &'a SourceCache,
}

impl HitDispatcher for BuildTools<'_> {
    fn dispatch(&self, ctx: &mut HitContext<'_>, argv: &[String]) -> ToolResult {
        match argv.first().map(String::as_str) {
            Some("build-unpack-sources") => self.unpack_sources(ctx, argv),
            Some("build-write-files") => self.write_files(ctx, argv),
            Some("create-links") => self.create_links(ctx, argv),
            Some("build-postprocess") => self.postprocess(ctx, argv),
            Some(other) => Err(format!("no such hit command: {other}").into()),
            None => Err("hit requires a command".into()),
        }
    }
}

/// `hit build-unpack-sources [--key=KEY] [--input=FILE]`
///
/// Extracts the sources listed under `KEY` of `FILE` into the current
/// directory, honoring each record's `target` and `strip`.
#[derive(Parser, Debug)]
#[command(name = "build-unpack-sources")]
struct UnpackSourcesArgs {
    /// Key to read from the JSON document.
    #[arg(long, default_value = "sources")]
    key: String,
    /// JSON parameter file.
    #[arg(long, default_value = "build.json")]
    input: String,
}

/// `hit build-write-files [--key=KEY] INPUT`
///
/// Materializes the inline files listed under `KEY` of `INPUT`.
#[derive(Parser, Debug)]
#[command(name = "build-write-files")]
struct WriteFilesArgs {
    /// Key to read from the JSON document (`/` for the whole document).
    #[arg(long, default_value = "/")]
    key: String,
    /// JSON parameter file.
    input: String,
}

/// `hit create-links [--key=KEY] INPUT`
///
/// Applies the links DSL rules listed under `KEY` of `INPUT`.
#[derive(Parser, Debug)]
#[command(name = "create-links")]
struct CreateLinksArgs {
    /// Key to read from the JSON document (`/` for the whole document).
    #[arg(long, default_value = "/")]
    key: String,
    /// JSON parameter file.
    input: String,
}

/// `hit build-postprocess [FLAGS] [PATH]`
///
/// Walks `PATH` (default `$ARTIFACT`) applying the selected handlers.
#[derive(Parser, Debug)]
#[command(name = "build-postprocess")]
struct PostprocessArgs {
    /// Remove all write bits from files.
    #[arg(long)]
    write_protect: bool,
    /// Rewrite absolute intra-artifact symlinks as relative.
    #[arg(long)]
    relative_symlinks: bool,
    /// Remove pkg-config files.
    #[arg(long)]
    remove_pkgconfig: bool,
    /// Replace the artifact path in pkg-config files with ${PACKAGE_DIR}.
    #[arg(long)]
    relative_pkgconfig: bool,
    /// Relativize artifact references in scripts matching the glob.
    #[arg(long = "relative-sh-script")]
    relative_sh_script: Vec<String>,
    /// Fail if the absolute artifact path survives anywhere.
    #[arg(long)]
    check_relocatable: bool,
    /// Regex of paths exempt from the relocatability check.
    #[arg(long = "check-ignore")]
    check_ignore: Vec<String>,
    /// Shebang re-wiring technique.
    #[arg(long, default_value = "none")]
    shebang: ShebangMode,
    /// Directory or file to process (default: $ARTIFACT).
    path: Option<String>,
}

impl BuildTools<'_> {
    fn unpack_sources(&self, ctx: &mut HitContext<'_>, argv: &[String]) -> ToolResult {
        let args = UnpackSourcesArgs::try_parse_from(argv)?;
        let doc = load_json(&ctx.cwd.join(&args.input))?;
        let records: Vec<SourceRecord> =
            serde_json::from_value(json_subkey(&doc, &args.key)?.clone())
                .map_err(|e| tool_err("build-unpack-sources", &format!("bad sources: {e}")))?;
        unpack_sources(self.source_cache, &records, ctx.cwd)?;
        Ok(())
    }

    fn write_files(&self, ctx: &mut HitContext<'_>, argv: &[String]) -> ToolResult {
        let args = WriteFilesArgs::try_parse_from(argv)?;
        let doc = load_json(&ctx.cwd.join(&args.input))?;
        let files: Vec<FileSpec> = serde_json::from_value(json_subkey(&doc, &args.key)?.clone())
            .map_err(|e| tool_err("build-write-files", &format!("bad files: {e}")))?;
        execute_files_dsl(&files, ctx.env, ctx.cwd)?;
        Ok(())
    }

    fn create_links(&self, ctx: &mut HitContext<'_>, argv: &[String]) -> ToolResult {
        let args = CreateLinksArgs::try_parse_from(argv)?;
        let doc = load_json(&ctx.cwd.join(&args.input))?;
        let rules: Vec<LinkRule> = serde_json::from_value(json_subkey(&doc, &args.key)?.clone())
            .map_err(|e| tool_err("create-links", &format!("bad rules: {e}")))?;
        let launcher = ctx.env.get("LAUNCHER").map(PathBuf::from);
        execute_links_dsl(&rules, ctx.env, ctx.cwd, launcher.as_deref())?;
        Ok(())
    }

    fn postprocess(&self, ctx: &mut HitContext<'_>, argv: &[String]) -> ToolResult {
        let args = PostprocessArgs::try_parse_from(argv)?;
        let options = PostprocessOptions {
            write_protect: args.write_protect,
            relative_symlinks: args.relative_symlinks,
            remove_pkgconfig: args.remove_pkgconfig,
            relative_pkgconfig: args.relative_pkgconfig,
            relative_sh_script: args.relative_sh_script,
            check_relocatable: args.check_relocatable,
            check_ignore: args.check_ignore,
            shebang: args.shebang,
        };
        let artifact = ctx.env.get("ARTIFACT").map(PathBuf::from);
        let launcher = ctx.env.get("LAUNCHER").map(PathBuf::from);
        let root = match (&args.path, &artifact) {
            (Some(path), _) => {
                let p = PathBuf::from(path);
                if p.is_absolute() {
                    p
                } else {
                    ctx.cwd.join(p)
                }
            }
            (None, Some(artifact)) => artifact.clone(),
            (None, None) => {
                ctx.logger
                    .error("path not given and ARTIFACT environment variable not set");
                return Err(tool_err(
                    "build-postprocess",
                    "path not given and ARTIFACT environment variable not set",
                )
                .into());
            }
        };
        postprocess(&root, artifact.as_deref(), launcher.as_deref(), &options)?;
        Ok(())
    }
}

impl clap::ValueEnum for ShebangMode {
    fn value_variants<'a>() -> &'a [Self] {
        &[ShebangMode::None, ShebangMode::Multiline, ShebangMode::Launcher]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            ShebangMode::None => clap::builder::PossibleValue::new("none"),
            ShebangMode::Multiline => clap::builder::PossibleValue::new("multiline"),
            ShebangMode::Launcher => clap::builder::PossibleValue::new("launcher"),
        })
    }
}

fn tool_err(tool: &str, reason: &str) -> BuildError {
    BuildError::Tool {
        tool: tool.to_string(),
        reason: reason.to_string(),
    }
}

fn load_json(path: &Path) -> Result<Value, BuildError> {
    let text = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| BuildError::Spec {
        reason: format!("{} is not valid JSON: {e}", path.display()),
    })
}

/// Resolves a `/`-separated key inside a JSON document; `/` (or the empty
/// string) is the document itself.
fn json_subkey<'a>(doc: &'a Value, key: &str) -> Result<&'a Value, BuildError> {
    let mut current = doc;
    for part in key.split('/').filter(|p| !p.is_empty()) {
        current = current.get(part).ok_or_else(|| BuildError::Spec {
            reason: format!("key \"{key}\" not found in parameter file"),
        })?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_subkey_root() {
        let doc = json!({"a": 1});
        assert_eq!(json_subkey(&doc, "/").unwrap(), &doc);
        assert_eq!(json_subkey(&doc, "").unwrap(), &doc);
    }

    #[test]
    fn json_subkey_nested() {
        let doc = json!({"parameters": {"links": [1, 2]}});
        assert_eq!(
            json_subkey(&doc, "parameters/links").unwrap(),
            &json!([1, 2])
        );
    }

    #[test]
    fn json_subkey_missing() {
        let doc = json!({"a": 1});
        assert!(json_subkey(&doc, "b").is_err());
    }

    #[test]
    fn unpack_sources_args_defaults() {
        let args =
            UnpackSourcesArgs::try_parse_from(["build-unpack-sources"]).unwrap();
        assert_eq!(args.key, "sources");
        assert_eq!(args.input, "build.json");
    }

    #[test]
    fn unpack_sources_args_with_key() {
        let args = UnpackSourcesArgs::try_parse_from([
            "build-unpack-sources",
            "--key=extra_sources",
            "--input=params.json",
        ])
        .unwrap();
        assert_eq!(args.key, "extra_sources");
        assert_eq!(args.input, "params.json");
    }

    #[test]
    fn postprocess_args_parse() {
        let args = PostprocessArgs::try_parse_from([
            "build-postprocess",
            "--write-protect",
            "--relative-symlinks",
            "--relative-sh-script=bin/*-config",
            "--check-relocatable",
            "--check-ignore=^build\\.log$",
            "--shebang=multiline",
        ])
        .unwrap();
        assert!(args.write_protect);
        assert!(args.relative_symlinks);
        assert_eq!(args.relative_sh_script, vec!["bin/*-config"]);
        assert_eq!(args.check_ignore, vec!["^build\\.log$"]);
        assert_eq!(args.shebang, ShebangMode::Multiline);
    }

    #[test]
    fn unknown_verb_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SourceCache::new(&tmp.path().join("src")).unwrap();
        let tools = BuildTools { source_cache: &sc };
        let logger = hdist_logging::Logger::null();
        let mut out = Vec::new();
        let env = std::collections::BTreeMap::new();
        let mut ctx = HitContext {
            env: &env,
            cwd: tmp.path(),
            logger: &logger,
            stdout: &mut out,
        };
        let err = tools
            .dispatch(&mut ctx, &["frobnicate".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("no such hit command"));
    }
}
