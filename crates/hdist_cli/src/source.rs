//! Source cache commands: `fetch`, `put`, `unpack`.

use std::path::PathBuf;

use clap::Parser;

use hdist_source_cache::{FileSet, Scheme, SourceKey, UnpackMode};

use crate::{CliError, Context};

/// Arguments for `hit fetch`.
#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// URL to download (`file:`, `http://` or `https://`), or a git
    /// repository when `--key` carries a `git:` key.
    pub url: String,

    /// Expected key (`scheme:digest`); enables mirrors and verification,
    /// and makes the fetch a no-op when already cached.
    #[arg(long)]
    pub key: Option<String>,

    /// Archive type when it cannot be inferred from the URL.
    #[arg(long = "type")]
    pub archive_type: Option<String>,

    /// Git rev (branch, tag or commit) to fetch; implies a git source.
    #[arg(long)]
    pub rev: Option<String>,

    /// Label for git sources inside the cache.
    #[arg(long, default_value = "source")]
    pub name: String,
}

pub fn fetch(ctx: &Context, args: FetchArgs) -> Result<(), CliError> {
    let cache = ctx.source_cache()?;

    if let Some(rev) = &args.rev {
        let key = cache.fetch_git(&args.url, rev, &args.name)?;
        println!("{key}");
        return Ok(());
    }

    if let Some(key) = &args.key {
        let key: SourceKey = key.parse()?;
        cache.fetch(Some(&args.url), &key, &args.name)?;
        println!("{key}");
        return Ok(());
    }

    let archive_type = match &args.archive_type {
        None => None,
        Some(t) => Some(t.parse::<Scheme>()?),
    };
    let key = cache.fetch_archive(&args.url, archive_type)?;
    println!("{key}");
    Ok(())
}

/// Arguments for `hit put`.
#[derive(Parser, Debug)]
pub struct PutArgs {
    /// Files to store; each is recorded under its path as given.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

pub fn put(ctx: &Context, args: PutArgs) -> Result<(), CliError> {
    let mut files = FileSet::new();
    for path in &args.files {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CliError::user(format!("cannot read {}: {e}", path.display())))?;
        files.insert(path.display().to_string(), contents);
    }
    let key = ctx.source_cache()?.put(&files)?;
    println!("{key}");
    Ok(())
}

/// Arguments for `hit unpack`.
#[derive(Parser, Debug)]
pub struct UnpackArgs {
    /// Source key (`scheme:digest`).
    pub key: String,

    /// Directory to unpack into.
    pub target: PathBuf,

    /// Stream the archive instead of verifying before extraction; only
    /// safe into a directory that is removed on failure.
    #[arg(long)]
    pub fast: bool,
}

pub fn unpack(ctx: &Context, args: UnpackArgs) -> Result<(), CliError> {
    let key: SourceKey = args.key.parse()?;
    let mode = if args.fast {
        UnpackMode::Fast
    } else {
        UnpackMode::Safe
    };
    ctx.source_cache()?.unpack(&key, &args.target, mode)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrap {
        #[command(subcommand)]
        cmd: Cmd,
    }

    #[derive(clap::Subcommand)]
    enum Cmd {
        Fetch(FetchArgs),
        Unpack(UnpackArgs),
    }

    #[test]
    fn fetch_args_parse() {
        let w = Wrap::parse_from([
            "x",
            "fetch",
            "http://example.com/z.tar.gz",
            "--key",
            "tar.gz:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
        ]);
        match w.cmd {
            Cmd::Fetch(args) => {
                assert_eq!(args.url, "http://example.com/z.tar.gz");
                assert!(args.key.is_some());
                assert!(args.rev.is_none());
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn unpack_args_default_safe() {
        let w = Wrap::parse_from(["x", "unpack", "tar.gz:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "out"]);
        match w.cmd {
            Cmd::Unpack(args) => assert!(!args.fast),
            _ => panic!("expected unpack"),
        }
    }
}
