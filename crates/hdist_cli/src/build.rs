//! `hit build` — run a build spec against the store.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;

use hdist_builder::{Builder, BuildSpec};
use hdist_common::ArtifactId;

use crate::{CliError, Context};

/// Arguments for `hit build`.
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Path to the build spec (`build.json`).
    pub spec: PathBuf,

    /// Bind a virtual import, e.g.
    /// `--virtual virtual:unix=unix/r0kal...`. May be repeated.
    #[arg(long = "virtual", value_name = "NAME=ID")]
    pub virtuals: Vec<String>,

    /// Override the configured keep policy for the build directory
    /// (never, error, always).
    #[arg(long, value_parser = parse_keep_policy)]
    pub keep_build: Option<hdist_config::KeepPolicy>,

    /// Only print the artifact ID the spec hashes to; build nothing.
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(ctx: &Context, args: BuildArgs) -> Result<(), CliError> {
    let text = std::fs::read_to_string(&args.spec)
        .map_err(|e| CliError::user(format!("cannot read {}: {e}", args.spec.display())))?;
    let spec = BuildSpec::from_json(&text)?;

    if args.dry_run {
        println!("{}", spec.artifact_id());
        return Ok(());
    }

    let virtuals = parse_virtuals(&args.virtuals)?;
    let keep = args.keep_build.unwrap_or(ctx.config.build.keep_build);

    let store = ctx.store()?;
    let source_cache = ctx.source_cache()?;
    let builder = Builder::new(&store, &source_cache, &ctx.logger);
    let (id, path) = builder.ensure_present(&spec, &virtuals, keep)?;
    println!("{id} {}", path.display());
    Ok(())
}

fn parse_keep_policy(s: &str) -> Result<hdist_config::KeepPolicy, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn parse_virtuals(pairs: &[String]) -> Result<HashMap<String, ArtifactId>, CliError> {
    let mut virtuals = HashMap::new();
    for pair in pairs {
        let (name, id) = pair.split_once('=').ok_or_else(|| {
            CliError::user(format!("--virtual takes NAME=ID, got \"{pair}\""))
        })?;
        if !name.starts_with(hdist_common::VIRTUAL_PREFIX) {
            return Err(CliError::user(format!(
                "virtual name \"{name}\" must start with \"virtual:\""
            )));
        }
        let id: ArtifactId = id
            .parse()
            .map_err(|e| CliError::user(format!("bad artifact id in \"{pair}\": {e}")))?;
        virtuals.insert(name.to_string(), id);
    }
    Ok(virtuals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_virtuals_accepts_pairs() {
        let digest = hdist_common::Digest::from_data(b"x");
        let id = ArtifactId::new("bash", digest).unwrap();
        let parsed = parse_virtuals(&[format!("virtual:bash={id}")]).unwrap();
        assert_eq!(parsed.get("virtual:bash"), Some(&id));
    }

    #[test]
    fn parse_virtuals_rejects_bad_forms() {
        assert!(parse_virtuals(&["no-equals".to_string()]).is_err());
        assert!(parse_virtuals(&["notvirtual=foo/bar".to_string()]).is_err());
        assert!(parse_virtuals(&["virtual:x=garbage".to_string()]).is_err());
    }
}
